//! Camera proxies
//!
//! A physical camera is opened once and shared by any number of clients.
//! Each client gets its own `ClientCameraProxy` with an independent stream
//! state and frame quota; the `HardwareCameraProxy` behind them owns the
//! driver connection and fans frames out.
//!
//! # Architecture
//!
//! ```text
//!                     HwCamera (driver)
//!                           │ deliver_frame(buffer)
//!                           ▼
//!               ┌───────────────────────┐
//!               │  HardwareCameraProxy  │
//!               │  frames: FrameTable   │──► set_max_frames_in_flight(Σ quotas)
//!               │  clients: [Weak<..>]  │
//!               └───────────┬───────────┘
//!                           │ fan-out, one ref per accepting client
//!         ┌─────────────────┼─────────────────┐
//!         ▼                 ▼                 ▼
//!  [ClientCameraProxy] [ClientCameraProxy] [ClientCameraProxy]
//!   quota 1, Running    quota 3, Running    Stopped (declines)
//!         │                 │
//!         ▼                 ▼
//!     FrameSink          FrameSink
//! ```
//!
//! # Buffer lifetime
//!
//! A buffer goes back to the driver exactly once: when the last client that
//! accepted it calls `done_with_frame`, or immediately if nobody accepted it.

pub mod client;
pub mod hardware;
pub mod record;
pub mod state;

pub use client::ClientCameraProxy;
pub use hardware::HardwareCameraProxy;
pub use record::FrameRecord;
pub use state::StreamState;
