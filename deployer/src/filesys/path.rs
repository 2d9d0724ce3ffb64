//! Checks for caller-supplied relative paths

use std::path::{Component, Path};

/// Whether `name` is a relative path that stays below the directory it is
/// joined onto: no root, no prefix, no `..`.
pub fn is_contained(name: &str) -> bool {
    let mut components = Path::new(name).components().peekable();
    components.peek().is_some()
        && components.all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}
