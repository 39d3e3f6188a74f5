//! Shared utility modules used across quire components.

pub mod varint;
