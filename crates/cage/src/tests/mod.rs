use std::fmt::Display;

mod r#async;
mod basic;
mod errors;
mod module_loader;
mod modules;
mod values;

pub mod test_helpers;

pub fn assert_contains(error: &impl Display, expected: &str) {
    assert!(
        format!("{}", error).contains(expected),
        "\nExpected: {expected}\nActual: {error}"
    );
}
