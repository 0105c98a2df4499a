//! Simulated hardware.
//!
//! The real devices live next to their capability traits
//! ([`crate::sensor::SerialSensor`], [`crate::pump::PhdUltraPump`]); this
//! module holds the simulated counterparts used by tests and `--simulate`.

pub mod mock;

pub use mock::{
    MemoryFrameSink, MemoryTelemetry, MockCamera, MockPump, MockSensor, PumpCall, SimulatedPlant,
};
