#![forbid(unsafe_code)]

pub mod display;
pub mod health;
pub mod http;
pub mod hub;
pub mod store;


#[cfg(test)]
mod hub_tests;

#[cfg(test)]
mod store_tests;
