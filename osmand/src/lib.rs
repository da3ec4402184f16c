pub mod api;
pub mod params;
pub mod report;
pub mod router;
