pub mod sender;
pub mod socket_helpers;
