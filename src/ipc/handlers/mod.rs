pub mod attendance;
pub mod audit;
pub mod auth;
pub mod classes;
pub mod core;
pub mod dashboard;
pub mod grades;
pub mod reports;
pub mod schema;
pub mod students;
pub mod users;
