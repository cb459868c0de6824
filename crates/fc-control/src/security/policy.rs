//! Static command policy for shell sessions
//!
//! A command is rejected when its leading token is on the blocklist, when
//! the full text matches a dangerous pattern, or when it is too long. The
//! checks run in that order and the first hit decides the reason.

use std::collections::HashSet;
use std::fmt;
use std::sync::OnceLock;

use regex::RegexSet;

/// Leading tokens that are never executed: deletion, formatting,
/// permission changes, privilege elevation, firewall changes, nested shells
/// and job schedulers
pub const BLOCKED_COMMANDS: &[&str] = &[
    "rm", "rmdir", "dd", "mkfs", "fdisk", "parted", "format", "del", "deltree",
    "chmod", "chown", "chgrp", "mount", "umount", "passwd", "su", "sudo", "visudo",
    "iptables", "ufw", "firewall-cmd", "netsh",
    "eval", "exec", "source", ".", "bash", "sh", "zsh",
    "crontab", "at", "batch",
];

/// Patterns matched against the full command text
pub const DANGEROUS_PATTERNS: &[&str] = &[
    r"rm\s+-rf\s+/",
    r">\s*/dev/",
    r"mkfs",
    r"dd\s+if=.*of=/dev",
    r"chmod\s+777",
    r"wget.*\|\s*sh",
    r"curl.*\|\s*bash",
];

/// Default maximum command length in characters
pub const DEFAULT_MAX_COMMAND_LENGTH: usize = 1000;

fn dangerous_patterns() -> &'static RegexSet {
    static PATTERNS: OnceLock<RegexSet> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        RegexSet::new(DANGEROUS_PATTERNS).expect("dangerous command patterns are valid regexes")
    })
}

/// Why a command was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReason {
    /// Leading token is on the blocklist
    BlockedCommand,
    /// Full text matches a dangerous pattern
    DangerousPattern,
    /// Longer than the configured limit
    TooLong,
}

impl fmt::Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockReason::BlockedCommand => write!(f, "Command is in blocked list"),
            BlockReason::DangerousPattern => write!(f, "Command matches dangerous pattern"),
            BlockReason::TooLong => write!(f, "Command too long"),
        }
    }
}

/// Outcome of a policy check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandVerdict {
    /// May be executed
    Allowed,
    /// Must not be executed
    Blocked(BlockReason),
}

impl CommandVerdict {
    /// Whether the command may run
    pub fn is_allowed(&self) -> bool {
        matches!(self, CommandVerdict::Allowed)
    }
}

/// Blocklist, pattern set and length limit applied to shell commands
#[derive(Debug, Clone)]
pub struct CommandPolicy {
    blocked: HashSet<&'static str>,
    max_length: usize,
}

impl CommandPolicy {
    /// Policy with the built-in blocklist and the given length limit
    pub fn new(max_length: usize) -> Self {
        Self {
            blocked: BLOCKED_COMMANDS.iter().copied().collect(),
            max_length,
        }
    }

    /// Check a command
    pub fn check(&self, command: &str) -> CommandVerdict {
        let leading = command
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_lowercase();

        if self.blocked.contains(leading.as_str()) {
            return CommandVerdict::Blocked(BlockReason::BlockedCommand);
        }

        if dangerous_patterns().is_match(command) {
            return CommandVerdict::Blocked(BlockReason::DangerousPattern);
        }

        if command.chars().count() > self.max_length {
            return CommandVerdict::Blocked(BlockReason::TooLong);
        }

        CommandVerdict::Allowed
    }
}

impl Default for CommandPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_COMMAND_LENGTH)
    }
}
