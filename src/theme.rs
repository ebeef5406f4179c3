//! Color theming for CLI output.
//!
//! Colors can be disabled globally with `--no-color` or the `NO_COLOR`
//! environment variable; every helper here then returns unstyled output.

use std::sync::atomic::{AtomicBool, Ordering};

static COLORS_ENABLED: AtomicBool = AtomicBool::new(true);

/// Disable all colors globally, for both owo_colors and comfy_table.
pub fn disable_colors() {
    COLORS_ENABLED.store(false, Ordering::Relaxed);
    owo_colors::set_override(false);
}

pub fn colors_enabled() -> bool {
    COLORS_ENABLED.load(Ordering::Relaxed)
}

/// Semantic color categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Semantic {
    Ticket,
    Value,
    Worker,
    Success,
    Failure,
    Muted,
}

/// comfy_table color for a category, `None` when colors are off.
pub fn table_color(semantic: Semantic) -> Option<comfy_table::Color> {
    if !colors_enabled() {
        return None;
    }
    Some(match semantic {
        Semantic::Ticket => comfy_table::Color::Yellow,
        Semantic::Value => comfy_table::Color::Green,
        Semantic::Worker => comfy_table::Color::Cyan,
        Semantic::Success => comfy_table::Color::Green,
        Semantic::Failure => comfy_table::Color::Red,
        Semantic::Muted => comfy_table::Color::DarkGrey,
    })
}

pub trait ThemedCell {
    fn themed(self, semantic: Semantic) -> Self;
}

impl ThemedCell for comfy_table::Cell {
    fn themed(self, semantic: Semantic) -> Self {
        match table_color(semantic) {
            Some(color) => self.fg(color),
            None => self,
        }
    }
}

/// Semantic owo_colors styles that respect [`disable_colors`].
pub trait Themed: owo_colors::OwoColorize + std::fmt::Display {
    fn success(&self) -> String {
        if colors_enabled() {
            format!("{}", owo_colors::OwoColorize::green(self))
        } else {
            self.to_string()
        }
    }

    fn failure(&self) -> String {
        if colors_enabled() {
            format!(
                "{}",
                owo_colors::OwoColorize::bold(&owo_colors::OwoColorize::red(self))
            )
        } else {
            self.to_string()
        }
    }

    fn muted(&self) -> String {
        if colors_enabled() {
            format!("{}", owo_colors::OwoColorize::dimmed(self))
        } else {
            self.to_string()
        }
    }
}

impl Themed for String {}
impl Themed for &str {}
impl Themed for u64 {}
impl Themed for usize {}
