// HTTP control surface for the jobber supervisor

pub mod handlers;
pub mod routes;
pub mod state;
