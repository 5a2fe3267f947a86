use anyhow::{Context, Result};
use clap::{Args, Parser, ValueEnum};
use dell_k2_fw::directory::{DeviceType, format_version};
use dell_k2_fw::identity::{UsbId, identify_device};
use dell_k2_fw::protocol::DockEc;
use hidapi::{DeviceInfo, HidApi, HidDevice};
use log::{info, warn};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Parser, Debug)]
#[command(name = "dell-k2-fw", version, about)]
enum Opt {
    /// List all connected docks
    List,

    /// Print dock identity and component versions
    Info {
        #[command(flatten)]
        spec: DeviceSpec,
    },

    /// Write a raw firmware payload to one dock component
    Update {
        #[command(flatten)]
        spec: DeviceSpec,

        /// Component to write
        #[arg(value_enum)]
        component: Component,

        /// Unit to write, for components the dock has several of (e.g. the PD port)
        #[arg(short, long, default_value_t = 0)]
        identifier: u8,

        file: PathBuf,
    },

    /// Record the component versions of a just-installed firmware package on the dock
    CommitPackage {
        #[command(flatten)]
        spec: DeviceSpec,

        file: PathBuf,
    },

    /// Have the dock apply staged firmware the next time it is unplugged
    PassiveUpdate {
        #[command(flatten)]
        spec: DeviceSpec,
    },
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum Component {
    Ec,
    Pd,
    UsbHub,
    Mst,
    Tbt,
    Qi,
    DpMux,
    Lan,
    Fan,
    Rmm,
    Wtpd,
}

impl From<Component> for DeviceType {
    fn from(c: Component) -> Self {
        match c {
            Component::Ec => DeviceType::MainEc,
            Component::Pd => DeviceType::Pd,
            Component::UsbHub => DeviceType::UsbHub,
            Component::Mst => DeviceType::Mst,
            Component::Tbt => DeviceType::Tbt,
            Component::Qi => DeviceType::Qi,
            Component::DpMux => DeviceType::DpMux,
            Component::Lan => DeviceType::Lan,
            Component::Fan => DeviceType::Fan,
            Component::Rmm => DeviceType::Rmm,
            Component::Wtpd => DeviceType::Wtpd,
        }
    }
}

#[derive(Error, Debug)]
enum MatchError {
    #[error("no docks match specification")]
    NoDevices,

    #[error("multiple docks match specification")]
    MultipleDevices,
}

#[derive(Args, Debug)]
struct DeviceSpec {
    /// USB serial number of the dock's EC interface
    #[arg(short, long)]
    serial: Option<String>,
}

impl DeviceSpec {
    fn matches(&self, device: &DeviceInfo) -> bool {
        let id = UsbId {
            vid: device.vendor_id(),
            pid: device.product_id(),
        };
        if !identify_device(id) {
            return false;
        }

        if let Some(ref x) = self.serial {
            if device.serial_number() != Some(x.as_str()) {
                return false;
            }
        }

        true
    }

    fn get_device<'a>(&self, hidapi: &'a HidApi) -> Result<(HidDevice, &'a DeviceInfo)> {
        let mut candidates = hidapi.device_list().filter(|d| self.matches(d));

        match candidates.next() {
            None => Err(MatchError::NoDevices.into()),
            Some(dev) => {
                if candidates.next().is_some() {
                    Err(MatchError::MultipleDevices.into())
                } else {
                    dev.open_device(hidapi)
                        .map_err(Into::into)
                        .map(|open| (open, dev))
                }
            }
        }
    }

    /// Open the matching dock and wait until it has reported its devices.
    fn open_dock(&self, hidapi: &HidApi) -> Result<DockEc<HidDevice>> {
        let (device, _) = self.get_device(hidapi)?;
        let mut dock = DockEc::new(device);
        dock.setup().context("dock setup failed")?;
        Ok(dock)
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(
        env_logger::Env::new()
            .filter_or("DELL_K2_FW_LOG", "info")
            .write_style("DELL_K2_FW_LOG_STYLE"),
    )
    .init();

    let mode = Opt::parse();

    let api = HidApi::new()?;

    match mode {
        Opt::List => list(&api),
        Opt::Info { spec } => info(&spec.open_dock(&api)?),
        Opt::Update {
            spec,
            component,
            identifier,
            file: path,
        } => {
            let payload =
                std::fs::read(&path).with_context(|| format!("reading {}", path.display()))?;

            let mut dock = spec.open_dock(&api)?;
            dock.is_ready_for_update()?;

            dock.set_lock(true)?;
            let result = dock.write_firmware(&payload, component.into(), identifier);
            if let Err(e) = dock.set_lock(false) {
                warn!("Failed to release dock: {e}");
            }
            result?;

            info!("Update written; unplug the dock to apply it if it doesn't restart on its own");
        }
        Opt::CommitPackage { spec, file: path } => {
            let blob =
                std::fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
            spec.open_dock(&api)?.commit_package(&blob)?;
        }
        Opt::PassiveUpdate { spec } => {
            spec.open_dock(&api)?.run_passive_update()?;
        }
    };

    Ok(())
}

fn info(dock: &DockEc<HidDevice>) {
    println!("Dock: {}", dock.name().unwrap_or("INVALID"));
    println!("Serial: {}", dock.serial().unwrap_or_default());
    if let Some(base_type) = dock.base_type() {
        println!("Type: {base_type}");
    }
    if let Some(sku) = dock.sku() {
        println!("SKU: {sku}");
    }
    if let Some(module) = dock.snapshot().and_then(|s| s.data.module()) {
        println!("Module: {module:?}");
    }
    println!("Package: {}", format_version(dock.package_version()));

    let Some(snapshot) = dock.snapshot() else {
        return;
    };
    println!("Components:");
    for entry in snapshot.directory.entries() {
        println!(
            "  {:<20} {} ({})",
            entry.name().unwrap_or("unknown"),
            format_version(entry.version()),
            entry.location(),
        );
    }
}

fn list(hidapi: &HidApi) {
    let all_spec = DeviceSpec { serial: None };
    for dev in hidapi.device_list().filter(|d| all_spec.matches(d)) {
        println!(
            "{} {} [{}]",
            dev.serial_number().unwrap_or("INVALID"),
            dev.product_string().unwrap_or("INVALID"),
            UsbId {
                vid: dev.vendor_id(),
                pid: dev.product_id(),
            },
        );
    }
}
