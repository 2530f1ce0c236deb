//! Built-in request handlers.

pub mod loyalty;

pub use loyalty::{
    ContactRepair, CreateContactHandler, LOYALTY_CONNECTOR, RecordTransactionHandler,
    UpdateContactHandler, register_loyalty_handlers,
};
