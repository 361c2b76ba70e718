pub mod icons;
pub mod progress;

pub use progress::{RunDisplay, describe, render_escalation};
