pub mod api;
pub mod retro;

pub use api::api_routes;
pub use retro::retro_routes;
