//! Output formatting for CLI commands.

use clap::ValueEnum;
use colored::Colorize;
use serde::Serialize;
use tabled::{Table, Tabled};

/// Output format.
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable table format.
    #[default]
    Table,
    /// JSON format.
    Json,
}

/// Print data in the specified format.
pub fn print_output<T: Serialize + Tabled>(data: &[T], format: OutputFormat) {
    match format {
        OutputFormat::Table => {
            if data.is_empty() {
                println!("{}", "No items found.".dimmed());
            } else {
                println!("{}", Table::new(data));
            }
        }
        OutputFormat::Json => println!("{}", format_json(data)),
    }
}

/// Print a success message.
///
/// Suppressed for JSON output so stdout stays machine-readable.
pub fn print_success(message: &str, format: OutputFormat) {
    if let OutputFormat::Table = format {
        println!("{} {}", "Success:".green().bold(), message);
    }
}

fn format_json<T: Serialize + ?Sized>(data: &T) -> String {
    serde_json::to_string_pretty(data).unwrap_or_else(|_| "[]".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize, Tabled)]
    struct Row {
        name: String,
        size: u64,
    }

    #[test]
    fn test_format_json_rows() {
        let rows = vec![Row {
            name: "layer".to_string(),
            size: 3,
        }];
        let value: serde_json::Value = serde_json::from_str(&format_json(&rows)).unwrap();
        assert_eq!(value[0]["name"], "layer");
        assert_eq!(value[0]["size"], 3);
    }
}
