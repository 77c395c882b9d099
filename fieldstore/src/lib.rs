pub mod error;

pub mod catalog;
pub mod config;

pub mod exec;

pub mod query;

pub mod store;

pub mod types {
    pub mod location;
}

pub mod form;

pub mod export;

pub mod util {
    pub mod io;
    pub mod names;
}
