//! Workflows bundled with the `stepwise` binary.

pub mod checkout;
