//! Domain models for the synchronization engine.

mod company;
mod invoice;
mod movement;

pub use company::Company;
pub use invoice::{Direction, Invoice, TypeCode};
pub use movement::{Movement, MovementKind};
