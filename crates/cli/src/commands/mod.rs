pub mod config_cmd;
pub mod init;
pub mod run;
pub mod serve;
pub mod stop;
