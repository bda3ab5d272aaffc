pub mod connection;
pub mod context;
pub mod dispatcher;

pub use dispatcher::Dispatcher;
