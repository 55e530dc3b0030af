pub mod communication;
pub mod messaging;
pub mod results;
pub mod state;
