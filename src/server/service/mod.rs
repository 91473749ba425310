pub mod backend;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod updater;

pub use updater::ServiceUpdater;
