//! Multi-peer scenarios over the in-memory network.
//!
//! This test suite validates:
//! - Space data replicating between devices of different identities
//! - Devices joining an identity through interactive and offline invitations
//! - Forged credentials and tampered invitations being refused
//! - Recovery from a wrong keyring passphrase and torn feed writes

pub mod test_utils;

#[cfg(test)]
mod replication_tests;

#[cfg(test)]
mod device_join_tests;

#[cfg(test)]
mod red_cell_tests;

#[cfg(test)]
mod recovery_tests;
