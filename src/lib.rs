#![warn(
    missing_docs,
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    clippy::cargo
)]
#![allow(
    clippy::transmute_undefined_repr,
    clippy::transmute_ptr_to_ptr,
    reason = "unavoidable without serde_nested_with changes"
)]
//! A framework for building bots on a federated, end-to-end-encrypted chat
//! protocol: login/session handling, exactly-once event processing over
//! live `/sync` and historical backfill, transparent decryption, a
//! declarative service/method registry for exposing bot functionality, and
//! a pluggable contract parser chain for recognizing what a chat event is
//! asking the bot to do.

pub mod prelude;

pub mod backfill;
pub mod config;
pub mod context;
pub mod contracts;
pub mod crypto;
pub mod db;
pub mod dedup;
pub mod dispatcher;
pub mod event;
pub mod health;
pub mod joinstore;
pub mod metrics;
pub mod router;
pub mod session;
pub mod sync;
pub mod tools;
pub mod typing;
