//! ovpnctl command-line front end

pub mod commands;
pub mod exit_code;
