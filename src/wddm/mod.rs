//! Raw WDDM DDI surface (D3DKMT thunks) consumed by the Windows submission path.

pub mod gdi;

pub use gdi::{D3dkmtHandle, Gdi, NtStatus};
