/*
 * Input/Output System
 *
 * This module provides low-level I/O operations and interfaces
 * for hardware communication via port I/O.
 */

pub mod pio;

pub use pio::{Io, Pio, ReadOnly};
