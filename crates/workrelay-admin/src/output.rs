use comfy_table::{presets::UTF8_FULL, Table};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Table,
    Json,
    Yaml,
}

impl Format {
    pub fn parse(s: &str) -> anyhow::Result<Self> {
        match s {
            "table" => Ok(Format::Table),
            "json" => Ok(Format::Json),
            "yaml" => Ok(Format::Yaml),
            other => anyhow::bail!(
                "unknown output format {} (expected table, json or yaml)",
                other
            ),
        }
    }
}

pub fn render(value: &Value, format: Format) -> anyhow::Result<String> {
    match format {
        Format::Json => Ok(serde_json::to_string_pretty(value)?),
        Format::Yaml => Ok(serde_yaml::to_string(value)?),
        Format::Table => Ok(render_table(value)),
    }
}

/// Objects become field/value tables, arrays of objects one row per element.
fn render_table(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut table = Table::new();
            table.load_preset(UTF8_FULL);
            table.set_header(vec!["Field", "Value"]);
            for (key, value) in map {
                table.add_row(vec![key.clone(), cell(value)]);
            }
            table.to_string()
        }
        Value::Array(items) if items.iter().all(Value::is_object) && !items.is_empty() => {
            let mut columns: Vec<String> = Vec::new();
            for item in items.iter().filter_map(Value::as_object) {
                for key in item.keys() {
                    if !columns.contains(key) {
                        columns.push(key.clone());
                    }
                }
            }

            let mut table = Table::new();
            table.load_preset(UTF8_FULL);
            table.set_header(columns.clone());
            for item in items {
                table.add_row(
                    columns
                        .iter()
                        .map(|c| item.get(c).map(cell).unwrap_or_default())
                        .collect::<Vec<_>>(),
                );
            }
            table.to_string()
        }
        Value::Array(items) if items.is_empty() => "(none)".to_string(),
        other => cell(other),
    }
}

fn cell(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "-".to_string(),
        other => other.to_string(),
    }
}
