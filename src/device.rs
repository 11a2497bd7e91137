//! Device abstraction the upload stage copies decoded batches into.
//!
//! The device owns two slots so upload of batch `k+1` can overlap the
//! consumer's use of batch `k`. Only the decode manager writes slots; the
//! consumer reads them between `Loader::next` calls, which establishes the
//! required ordering through the decode-pool handshake.

use std::sync::Mutex;

use crate::error::{Error, Result};

/// Number of device-resident batch slots.
pub const DEVICE_SLOTS: usize = 2;

/// Discriminates host memory from an accelerator.
///
/// The decode pool allocates pinned host buffers iff the device is an
/// accelerator, so its DMA engine can copy from them directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    /// Batches land in ordinary host memory.
    Cpu,
    /// Batches are copied to accelerator memory; host staging must be pinned.
    Accelerator,
}

/// Destination for decoded batches.
pub trait Device: Send + Sync {
    /// Bind the device to the calling thread (context, affinity).
    ///
    /// Invoked once by the decode manager before any upload. An error aborts
    /// the pipeline before a single batch is produced.
    fn init(&self) -> Result<()>;

    /// Whether this device is host memory or an accelerator.
    fn kind(&self) -> DeviceKind;

    /// Copy a decoded, transposed data buffer into `slot`.
    fn copy_data(&self, slot: usize, bytes: &[u8]) -> Result<()>;

    /// Copy the packed target rows into `slot`.
    fn copy_labels(&self, slot: usize, bytes: &[u8]) -> Result<()>;
}

struct HostSlot {
    data: Vec<u8>,
    labels: Vec<u8>,
}

/// Host-memory device: two slot pairs the consumer reads batches from.
///
/// This is the device for CPU training and for tests; an accelerator backend
/// implements [`Device`] over its own transfer engine.
pub struct HostDevice {
    slots: [Mutex<HostSlot>; DEVICE_SLOTS],
}

impl HostDevice {
    /// Create a host device with empty slots.
    pub fn new() -> Self {
        Self {
            slots: [
                Mutex::new(HostSlot {
                    data: Vec::new(),
                    labels: Vec::new(),
                }),
                Mutex::new(HostSlot {
                    data: Vec::new(),
                    labels: Vec::new(),
                }),
            ],
        }
    }

    fn slot(&self, slot: usize) -> Result<&Mutex<HostSlot>> {
        self.slots.get(slot).ok_or_else(|| Error::Device {
            reason: format!("slot {slot} out of range (device has {DEVICE_SLOTS} slots)"),
        })
    }

    /// Current contents of a slot's data buffer.
    pub fn data(&self, slot: usize) -> Result<Vec<u8>> {
        Ok(self.slot(slot)?.lock().unwrap().data.clone())
    }

    /// Current contents of a slot's label buffer.
    pub fn labels(&self, slot: usize) -> Result<Vec<u8>> {
        Ok(self.slot(slot)?.lock().unwrap().labels.clone())
    }
}

impl Default for HostDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl Device for HostDevice {
    fn init(&self) -> Result<()> {
        Ok(())
    }

    fn kind(&self) -> DeviceKind {
        DeviceKind::Cpu
    }

    fn copy_data(&self, slot: usize, bytes: &[u8]) -> Result<()> {
        let mut guard = self.slot(slot)?.lock().unwrap();
        guard.data.clear();
        guard.data.extend_from_slice(bytes);
        Ok(())
    }

    fn copy_labels(&self, slot: usize, bytes: &[u8]) -> Result<()> {
        let mut guard = self.slot(slot)?.lock().unwrap();
        guard.labels.clear();
        guard.labels.extend_from_slice(bytes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_device_slots_independent() {
        let dev = HostDevice::new();
        dev.copy_data(0, b"batch0").unwrap();
        dev.copy_data(1, b"batch1").unwrap();
        dev.copy_labels(0, b"a").unwrap();
        dev.copy_labels(1, b"b").unwrap();

        assert_eq!(dev.data(0).unwrap(), b"batch0");
        assert_eq!(dev.data(1).unwrap(), b"batch1");
        assert_eq!(dev.labels(0).unwrap(), b"a");
        assert_eq!(dev.labels(1).unwrap(), b"b");
    }

    #[test]
    fn test_host_device_overwrites_slot() {
        let dev = HostDevice::new();
        dev.copy_data(0, b"first").unwrap();
        dev.copy_data(0, b"second").unwrap();
        assert_eq!(dev.data(0).unwrap(), b"second");
    }

    #[test]
    fn test_host_device_slot_out_of_range() {
        let dev = HostDevice::new();
        assert!(dev.copy_data(2, b"x").is_err());
        assert!(dev.labels(5).is_err());
    }
}
