/// Check if a HID interface belongs to a supported dock and derive the dock's identity.
pub mod identity;

/// Decode the dock's table of attached sub-devices and look entries up in it.
pub mod directory;

/// Fixed-layout binary records exchanged with the dock EC.
pub mod wire;

/// Bounded retry with a fixed delay between attempts.
pub mod retry;

/// The request/response channel to the dock EC, and its implementation over hidapi.
pub mod transport;

/// Stream a firmware payload to a dock component in acknowledged chunks.
pub mod transfer;

/// Query and update a connected dock through its embedded controller.
pub mod protocol;

#[cfg(test)]
mod mock;
