// Engine constants: movement geometry, backoff tuning, chat phrases.

use std::time::Duration;

// Patrol movement
pub const RETURN_STEP: f64 = 0.8; // units moved back toward the anchor per tick
pub const STEP_LENGTHS: [f64; 2] = [1.0, 2.0];

// Heading offsets (degrees) for forward, back, left, right relative to yaw
pub const STEP_HEADINGS: [f64; 4] = [0.0, 180.0, 90.0, -90.0];

// Turn
pub const MAX_PITCH: f64 = 10.0;

// Chat
pub const JUMP_PROBABILITY: f64 = 0.1;

pub const CHAT_PHRASES: &[&str] = &[
    "hi",
    "hello everyone",
    "just looking around",
    "nice weather today",
    "brb",
    "anyone online?",
    "what a view",
    "lol",
];

// Backoff
pub const BACKOFF_STEP: Duration = Duration::from_secs(5);
pub const BACKOFF_CAP: Duration = Duration::from_secs(30);
pub const ROTATE_DELAY: Duration = Duration::from_secs(1);
pub const MAX_ATTEMPTS: u32 = 20;

// Protocol versions tried when none are configured, newest first
pub const DEFAULT_VERSIONS: &[&str] = &["1.21.50", "1.21.40", "1.21.30", "1.21.0", "1.20.80"];

pub const DEFAULT_USERNAME: &str = "AFKBot";
