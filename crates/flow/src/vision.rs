//! Vision prompts and defensive parsing of model answers

use regex::Regex;
use std::sync::OnceLock;

use flowscout_common::Viewport;

/// Sentinel the model returns when the target is absent
pub const NOT_FOUND: &str = "NOT_FOUND";

pub fn locate_prompt(target: &str) -> String {
    format!(
        "Find the UI element showing the text \"{target}\" in this screenshot. \
         Reply with only the pixel coordinates of its center as x,y. \
         If it is not visible, reply with {NOT_FOUND}."
    )
}

pub fn visibility_prompt(target: &str) -> String {
    format!(
        "Is the text or element \"{target}\" visible in this screenshot? \
         Answer YES or NO, then one short sentence."
    )
}

fn number_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"-?\d+(?:\.\d+)?").expect("valid regex"))
}

/// Extract a coordinate pair from a model answer.
///
/// Accepts `x,y`, `(x, y)` or free text holding two numbers. `None` for the
/// not-found sentinel or fewer than two numbers.
pub fn parse_coordinates(answer: &str) -> Option<(i64, i64)> {
    if answer.to_ascii_uppercase().contains(NOT_FOUND) {
        return None;
    }
    let mut numbers = number_re()
        .find_iter(answer)
        .filter_map(|m| m.as_str().parse::<f64>().ok());
    let x = numbers.next()?;
    let y = numbers.next()?;
    Some((x.round() as i64, y.round() as i64))
}

/// Interpret a YES/NO answer.
///
/// The first YES/NO word decides, so a restated question ahead of the
/// answer is skipped. `None` when no such word appears.
pub fn parse_visibility(answer: &str) -> Option<bool> {
    answer
        .split(|c: char| !c.is_ascii_alphabetic())
        .find_map(|word| match word.to_ascii_lowercase().as_str() {
            "yes" | "true" => Some(true),
            "no" | "false" => Some(false),
            _ => None,
        })
}

/// Resolve `x,y` where each part is pixels or a viewport percentage
pub fn resolve_point(spec: &str, viewport: Viewport) -> Option<(i64, i64)> {
    let (x, y) = spec.split_once(',')?;
    Some((
        resolve_axis(x, viewport.width)?,
        resolve_axis(y, viewport.height)?,
    ))
}

fn resolve_axis(part: &str, extent: u32) -> Option<i64> {
    let part = part.trim();
    match part.strip_suffix('%') {
        Some(pct) => {
            let pct: f64 = pct.trim().parse().ok()?;
            Some((pct / 100.0 * f64::from(extent)).round() as i64)
        }
        None => part.parse::<f64>().ok().map(|v| v.round() as i64),
    }
}
