//! End-to-end helpers for imrelay scenarios: a relay on a random local port
//! backed by a seeded SQLite file, and a thin client wrapper.

pub mod harness;
