//! Camera registry
//!
//! The registry is the factory consumers talk to. It opens each physical
//! camera once, no matter how many clients ask for it, and closes it again
//! when the last of them leaves. It also arbitrates the single physical
//! display.
//!
//! # Architecture
//!
//! ```text
//!                         CameraRegistry
//!                ┌──────────────────────────────┐
//!                │ cameras: Vec<Arc<Hardware..>>│
//!                │ display: DisplaySlot {       │
//!                │   generation,                │
//!                │   Weak<DisplayHandle>,       │
//!                │ }                            │
//!                └──────────────┬───────────────┘
//!                               │ open_camera("front")
//!               ┌───────────────┴───────────────┐
//!               ▼                               ▼
//!     found: hw.mint_client()        missing: driver.open_camera()
//!                                      └─► HardwareCameraProxy::new()
//!                                            └─► hw.mint_client()
//! ```
//!
//! Display handles are generation-tagged. Opening the display again
//! supersedes the previous owner; a late `close_display` from that owner
//! is recognized by its old generation and ignored.

pub mod config;
pub mod display;
pub mod store;

pub use config::RegistryConfig;
pub use display::DisplayHandle;
pub use store::CameraRegistry;
