pub mod bundle;
pub mod catalog;
pub mod config;
pub mod domain;
pub mod error;
pub mod forecast;
pub mod geometry;
pub mod loader;
pub mod mapfile;
pub mod merge;
pub mod output;
pub mod publish;
pub mod remote;
pub mod resolver;
pub mod retry;
pub mod runner;
pub mod vector;
pub mod workspace;
