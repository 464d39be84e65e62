//! Database Module - Lokale Persistenz
//!
//! Dieses Modul verwaltet die Call Records (Anrufverlauf) in SQLite.
//!

mod call_records;

pub use call_records::{CallRecord, CallRecordStore, CallRecordsDatabase, CallStatus, DatabaseError};
