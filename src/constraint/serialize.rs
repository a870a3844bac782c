//! Text serialization of constraint sets. The simple form is one constraint
//! per comma-separated field, `0xv` for a value and `0xlo-0xhi` for a range;
//! dump files carry a fixed number of fields per line and use the
//! `<name>_<serial>.ConstraintSet` naming scheme.

use std::fmt::Write as _;
use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

use super::{Constraint, ConstraintSet};
use crate::error::Error;

/// Formats one constraint in the simple form.
pub fn constraint_to_string(constraint: &Constraint) -> String {
    match constraint {
        Constraint::Value(value) => format!("0x{:x}", value),
        Constraint::Range { lower, upper } => format!("0x{:x}-0x{:x}", lower, upper),
    }
}

/// Formats a whole set in the simple form on one line.
pub fn to_simple_string(set: &ConstraintSet) -> String {
    let mut out = String::new();
    for (index, constraint) in set.constraints().iter().enumerate() {
        if index > 0 {
            out.push(',');
        }
        let _ = write!(out, "{}", constraint_to_string(constraint));
    }
    out
}

/// Parses the simple form, accepting commas and line breaks as separators.
pub fn parse(text: &str) -> Result<ConstraintSet, Error> {
    let mut set = ConstraintSet::new();
    for field in text.split(|c: char| c == ',' || c.is_whitespace()) {
        let field = field.trim();
        if field.is_empty() {
            continue;
        }
        match split_range(field) {
            Some((lower, upper)) => {
                let lower = parse_number(lower)?;
                let upper = parse_number(upper)?;
                set.add_range(lower, upper);
            }
            None => {
                let value = parse_number(field)?;
                set.add_value(value);
            }
        }
    }
    Ok(set)
}

/// Splits `lo-hi` at the separating dash, tolerating the `0x` prefixes.
fn split_range(field: &str) -> Option<(&str, &str)> {
    // Skip a leading dash so bare hex numbers are not mistaken for ranges.
    let position = field[1..].find('-')? + 1;
    Some((&field[..position], &field[position + 1..]))
}

fn parse_number(text: &str) -> Result<u64, Error> {
    let text = text.trim();
    let digits = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")).unwrap_or(text);
    u64::from_str_radix(digits, 16).map_err(|_| {
        Error::ConstraintExhausted(format!("malformed constraint field {:?}", text))
    })
}

/// Serializer writing the simple form with a fixed field count per line.
pub struct ConstraintSetSerializer<'a> {
    set: &'a ConstraintSet,
    per_line: usize,
}

impl<'a> ConstraintSetSerializer<'a> {
    pub fn new(set: &'a ConstraintSet, per_line: usize) -> Self {
        Self { set, per_line: per_line.max(1) }
    }

    /// Renders the set with line breaks every `per_line` fields.
    pub fn to_lines(&self) -> String {
        let mut out = String::new();
        for (index, constraint) in self.set.constraints().iter().enumerate() {
            if index > 0 {
                if index % self.per_line == 0 {
                    out.push('\n');
                } else {
                    out.push(',');
                }
            }
            let _ = write!(out, "{}", constraint_to_string(constraint));
        }
        out
    }

    /// Writes `<name>_<serial>.ConstraintSet` in the given directory.
    pub fn serialize(&self, directory: &Path, name: &str, serial: u32) -> Result<(), Error> {
        let path = directory.join(format!("{}_{}.ConstraintSet", name, serial));
        let mut file = File::create(path)?;
        file.write_all(self.to_lines().as_bytes())?;
        file.write_all(b"\n")?;
        Ok(())
    }
}

/// Reads a `.ConstraintSet` dump back, merging every line into `set`.
pub fn deserialize(set: &mut ConstraintSet, directory: &Path, name: &str, serial: u32) -> Result<(), Error> {
    let path = directory.join(format!("{}_{}.ConstraintSet", name, serial));
    let reader = BufReader::new(File::open(path)?);
    for line in reader.lines() {
        let parsed = parse(&line?)?;
        set.merge_constraint_set(&parsed);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_simple_form() {
        let mut set = ConstraintSet::new();
        set.add_range(0x10, 0x1f);
        set.add_value(0x30);
        set.add_range(0x100, 0x1ff);
        let text = to_simple_string(&set);
        assert_eq!(text, "0x10-0x1f,0x30,0x100-0x1ff");
        let parsed = parse(&text).unwrap();
        assert_eq!(parsed, set);
    }

    #[test]
    fn line_splitting_respects_field_count() {
        let mut set = ConstraintSet::new();
        for i in 0..5 {
            set.add_value(i * 10);
        }
        let serializer = ConstraintSetSerializer::new(&set, 2);
        let joined = serializer.to_lines();
        let lines: Vec<&str> = joined.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "0x0,0xa");
        assert_eq!(lines[2], "0x28");
    }

    #[test]
    fn parse_tolerates_whitespace_and_lines() {
        let parsed = parse("0x0-0x4\n0x19-0x1d, 0x40").unwrap();
        assert_eq!(parsed.to_simple_string(), "0x0-0x4,0x19-0x1d,0x40");
    }
}
