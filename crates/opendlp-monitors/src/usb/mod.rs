//! USB monitoring: device arrivals and file transfers to removable media.

pub mod device;
pub mod port;
pub mod transfer;

pub use device::UsbDeviceMonitor;
pub use port::{
    DeviceEvent, MockDriveProvider, MockUsbPort, NullDriveProvider, NullUsbPort,
    RemovableDriveProvider, UsbControlPort,
};
pub use transfer::{TransferState, UsbTransferMonitor};
