//! Storefront Engine
//!
//! Cart pricing, coupon evaluation, stock-aware cart mutations and the
//! inventory ledger / stocktake workflow behind the storefront and the
//! admin back-office. HTTP handlers and views call into these services and
//! get plain data back.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod migrator;
pub mod services;

pub use errors::{ErrorKind, ServiceError};
