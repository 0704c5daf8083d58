//! Output formatting for CLI

use anyhow::Result;
use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use peergate_common::Error;
use serde::Serialize;

/// Output format
#[derive(Debug, Clone, Copy, ValueEnum, Default, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable table format
    #[default]
    Table,
    /// JSON format
    Json,
    /// YAML format
    Yaml,
    /// Plain text format
    Plain,
}

impl OutputFormat {
    /// Whether output is meant for machines rather than a terminal
    pub fn is_structured(&self) -> bool {
        matches!(self, OutputFormat::Json | OutputFormat::Yaml)
    }
}

/// Trait for items that can be displayed in a table
pub trait TableDisplay {
    fn headers() -> Vec<&'static str>;
    fn row(&self) -> Vec<String>;
}

/// Render any serializable value as JSON or YAML
pub fn render_structured<T: Serialize + ?Sized>(value: &T, format: OutputFormat) -> Result<String> {
    Ok(match format {
        OutputFormat::Yaml => serde_yaml::to_string(value)?,
        _ => serde_json::to_string_pretty(value)?,
    })
}

pub fn print_structured<T: Serialize + ?Sized>(value: &T, format: OutputFormat) -> Result<()> {
    println!("{}", render_structured(value, format)?.trim_end());
    Ok(())
}

fn table_of<'a, T: TableDisplay + 'a>(items: impl IntoIterator<Item = &'a T>) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(T::headers());
    for item in items {
        table.add_row(item.row());
    }
    table
}

/// `Header: value` lines, one per column
fn plain_lines<T: TableDisplay>(item: &T) -> Vec<String> {
    T::headers()
        .iter()
        .zip(item.row())
        .map(|(header, value)| format!("{}: {}", header, value))
        .collect()
}

/// Print a single item
pub fn print_item<T: Serialize + TableDisplay>(item: &T, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Table => println!("{}", table_of([item])),
        OutputFormat::Json | OutputFormat::Yaml => print_structured(item, format)?,
        OutputFormat::Plain => println!("{}", plain_lines(item).join("\n")),
    }
    Ok(())
}

/// Print a list of items
pub fn print_list<T: Serialize + TableDisplay>(items: &[T], format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json | OutputFormat::Yaml => print_structured(items, format)?,
        _ if items.is_empty() => println!("No items found."),
        OutputFormat::Table => println!("{}", table_of(items)),
        OutputFormat::Plain => {
            let blocks: Vec<String> = items.iter().map(|i| plain_lines(i).join("\n")).collect();
            println!("{}", blocks.join("\n---\n"));
        }
    }
    Ok(())
}

/// One-line description of an engine error: message, kind and, for node
/// failures, what is known about the node and whether a retry is safe
pub fn error_line(err: &Error) -> String {
    let mut line = format!("{} [{}]", err, err.kind());
    if let Some(cause) = err.node_cause() {
        line.push_str(&format!("; node {}", cause.state));
    }
    if err.is_retryable() {
        line.push_str("; retrying the same request is safe");
    }
    line
}

/// Print success message
pub fn print_success(message: &str) {
    println!("✅ {}", message);
}

/// Print error message
pub fn print_error(message: &str) {
    eprintln!("❌ {}", message);
}

/// Print warning message
pub fn print_warning(message: &str) {
    println!("⚠️  {}", message);
}

#[cfg(test)]
mod tests {
    use super::*;
    use peergate_common::{ConflictKind, NodeApplyError, NodeOp};

    #[derive(Serialize)]
    struct Row {
        name: String,
        size: u32,
    }

    impl TableDisplay for Row {
        fn headers() -> Vec<&'static str> {
            vec!["Name", "Size"]
        }

        fn row(&self) -> Vec<String> {
            vec![self.name.clone(), self.size.to_string()]
        }
    }

    #[test]
    fn test_structured_rendering() {
        let row = Row {
            name: "wg0".to_string(),
            size: 3,
        };
        assert_eq!(
            render_structured(&row, OutputFormat::Json).unwrap(),
            "{\n  \"name\": \"wg0\",\n  \"size\": 3\n}"
        );
        assert_eq!(
            render_structured(&row, OutputFormat::Yaml).unwrap(),
            "name: wg0\nsize: 3\n"
        );
        assert_eq!(plain_lines(&row), vec!["Name: wg0", "Size: 3"]);
    }

    #[test]
    fn test_structured_rendering_reports_errors() {
        // JSON object keys must be strings
        let mut map = std::collections::BTreeMap::new();
        map.insert(vec![1u8], 1u8);
        assert!(render_structured(&map, OutputFormat::Json).is_err());
    }

    #[test]
    fn test_error_line() {
        let err = Error::ProvisionFailed {
            peer_id: None,
            cause: NodeApplyError::unknown("wg-node-1", NodeOp::Add, "timed out"),
        };
        let line = error_line(&err);
        assert!(line.contains("[provision_failed]"));
        assert!(line.contains("; node state unknown"));
        assert!(line.ends_with("retrying the same request is safe"));

        let err = Error::conflict(ConflictKind::KeyMismatch, "device has another key");
        assert_eq!(
            error_line(&err),
            "Conflict (key_mismatch): device has another key [conflict]"
        );
    }
}
