#![deny(dead_code)]
#![deny(unused_imports)]

pub mod config;
pub mod defaults;
pub mod encode;
pub mod evaluate;
pub mod handler;
pub mod http;
pub mod schema;
pub mod startup;

#[path = "../model/mod.rs"]
pub mod model;
