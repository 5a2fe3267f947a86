//! Recording fake of the dock EC for unit tests.

use crate::transport::{EcCommand, PAGE_SIZE, Transport, TransportError};
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

/// Everything the code under test asked the transport to do, in order.
#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    Query(EcCommand),
    Send(Vec<u8>),
    Page(Vec<u8>),
    ReadReport,
    Sleep(Duration),
}

#[derive(Clone)]
enum Response {
    Data(Vec<u8>),
    Fail(fn() -> TransportError),
}

#[derive(Default)]
pub struct MockTransport {
    /// Queued responses per command. The last one stays queued and is repeated.
    queries: RefCell<HashMap<EcCommand, VecDeque<Response>>>,
    /// Queued reports returned by `read_report`, in order.
    reports: RefCell<VecDeque<[u8; PAGE_SIZE]>>,
    send_failure: Cell<Option<fn() -> TransportError>>,
    events: RefCell<Vec<Event>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue_query(&self, command: EcCommand, data: Vec<u8>) {
        self.push(command, Response::Data(data));
    }

    pub fn queue_query_failure(&self, command: EcCommand, error: fn() -> TransportError) {
        self.push(command, Response::Fail(error));
    }

    /// Drop everything queued for `command`.
    pub fn clear_queries(&self, command: EcCommand) {
        self.queries.borrow_mut().remove(&command);
    }

    /// Queue an acknowledgement report carrying `code` at the response offset.
    pub fn queue_ack(&self, code: u8) {
        let mut report = [0u8; PAGE_SIZE];
        report[1] = code;
        self.reports.borrow_mut().push_back(report);
    }

    pub fn fail_sends(&self, error: fn() -> TransportError) {
        self.send_failure.set(Some(error));
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.borrow().clone()
    }

    pub fn sends(&self) -> Vec<Vec<u8>> {
        self.filter(|e| match e {
            Event::Send(data) => Some(data.clone()),
            _ => None,
        })
    }

    pub fn pages(&self) -> Vec<Vec<u8>> {
        self.filter(|e| match e {
            Event::Page(data) => Some(data.clone()),
            _ => None,
        })
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        self.filter(|e| match e {
            Event::Sleep(d) => Some(*d),
            _ => None,
        })
    }

    pub fn query_count(&self, command: EcCommand) -> usize {
        self.filter(|e| (*e == Event::Query(command)).then_some(()))
            .len()
    }

    fn push(&self, command: EcCommand, response: Response) {
        self.queries
            .borrow_mut()
            .entry(command)
            .or_default()
            .push_back(response);
    }

    fn filter<T>(&self, f: impl Fn(&Event) -> Option<T>) -> Vec<T> {
        self.events.borrow().iter().filter_map(f).collect()
    }

    fn record(&self, event: Event) {
        self.events.borrow_mut().push(event);
    }
}

impl Transport for MockTransport {
    fn query(&self, command: EcCommand, _len: usize) -> Result<Vec<u8>, TransportError> {
        self.record(Event::Query(command));

        let mut queries = self.queries.borrow_mut();
        let queue = queries
            .get_mut(&command)
            .filter(|q| !q.is_empty())
            .ok_or(TransportError::NoReport)?;
        let response = if queue.len() > 1 {
            queue.pop_front().unwrap()
        } else {
            queue[0].clone()
        };

        match response {
            Response::Data(data) => Ok(data),
            Response::Fail(error) => Err(error()),
        }
    }

    fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        self.record(Event::Send(data.to_vec()));
        match self.send_failure.get() {
            Some(error) => Err(error()),
            None => Ok(()),
        }
    }

    fn write_page(&self, page: &[u8; PAGE_SIZE]) -> Result<(), TransportError> {
        self.record(Event::Page(page.to_vec()));
        Ok(())
    }

    fn read_report(&self) -> Result<[u8; PAGE_SIZE], TransportError> {
        self.record(Event::ReadReport);
        self.reports
            .borrow_mut()
            .pop_front()
            .ok_or(TransportError::NoReport)
    }

    fn sleep(&self, duration: Duration) {
        self.record(Event::Sleep(duration));
    }
}
