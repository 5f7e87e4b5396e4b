pub mod agent;
pub mod cli;
pub mod config;
pub mod controller;
pub mod coverage;
pub mod diff;
pub mod error;
pub mod gate;
pub mod llm;
pub mod process;
pub mod prompts;
pub mod retry;
pub mod runner;
pub mod sandbox;
pub mod session;
pub mod state;
