//! CLI module - Command-line interface for VM Captain
//!
//! This module provides a structured CLI using clap for argument parsing.

mod commands;

use clap::{Parser, Subcommand};

/// VM Captain - self-service dashboard backend for vCenter VMs
#[derive(Parser)]
#[command(name = "vmcaptain")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the HTTP API (default)
    #[command(alias = "daemon")]
    Serve,

    /// Create default config file
    #[command(alias = "--init")]
    Init,

    /// Manage dashboard users
    User {
        #[command(subcommand)]
        command: UserCommands,
    },
}

#[derive(Subcommand)]
pub enum UserCommands {
    /// Create a user
    Add {
        username: String,
        /// ADMIN or USER
        #[arg(long, default_value = "USER")]
        role: String,
        /// Password; read from stdin when omitted
        #[arg(long)]
        password: Option<String>,
    },
    /// List users
    #[command(alias = "ls")]
    List,
    /// Set a new password for a user
    ResetSecret {
        username: String,
        /// New password; read from stdin when omitted
        #[arg(long)]
        password: Option<String>,
    },
}

pub use commands::*;
