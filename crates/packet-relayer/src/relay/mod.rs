// Relay side: message construction and the per-wallet submission loop

pub mod factory;
pub mod wallet;

pub use factory::{ClientUpdate, MessageFactory};
pub use wallet::{parse_expected_sequence, timeout_cutoff, WalletContext, WalletWorker};
