//! Shared UI icons, with plain-text fallbacks for terminals without emoji.

use console::Emoji;

// Status indicators
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "[OK]");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "[ERR]");
pub static SPARKLE: Emoji<'_, '_> = Emoji("✨ ", "*");
pub static RETRY: Emoji<'_, '_> = Emoji("🔄 ", "[RETRY]");

// Run indicators
pub static RUNNING: Emoji<'_, '_> = Emoji("▶️  ", "[>]");
pub static PAUSE: Emoji<'_, '_> = Emoji("⏸️  ", "[||]");
pub static PHASE: Emoji<'_, '_> = Emoji("📍 ", "[PHASE]");
pub static SPLIT: Emoji<'_, '_> = Emoji("✂️  ", "[SPLIT]");
pub static RESET: Emoji<'_, '_> = Emoji("🧹 ", "[RESET]");

// Attention indicators
pub static ESCALATION: Emoji<'_, '_> = Emoji("🚨 ", "[!]");
pub static BLOCKER: Emoji<'_, '_> = Emoji("🚧 ", "[BLOCK]");
pub static REVIEW: Emoji<'_, '_> = Emoji("🔍 ", "[R]");
pub static ACCEPT: Emoji<'_, '_> = Emoji("🙋 ", "[?]");
