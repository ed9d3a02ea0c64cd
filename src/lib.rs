//! Witnet explorer reputation engine
//!
//! Batch process that replays the reputation bookkeeping of the Witnet network from the settled
//! data requests, and stores the reputation of every identity at every epoch.

#![deny(rust_2018_idioms)]
#![deny(non_upper_case_globals)]
#![deny(non_camel_case_types)]
#![deny(non_snake_case)]
#![deny(unused_mut)]

pub mod aggregator;
pub mod config;
pub mod driver;
pub mod persistence;
pub mod settlement;
