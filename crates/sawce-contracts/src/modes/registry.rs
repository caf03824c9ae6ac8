use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use indexmap::IndexMap;
use serde::Deserialize;
use serde_json::{Map, Value};

use super::mode::Mode;

const DEFAULT_MODES_JSON: &str = include_str!("../../resources/default_modes.json");

const CONTENT_SAFETY_CLAUSE: &str = "Never comment on, guess at, or joke about the race, ethnicity, religion, gender, sexual orientation, age, disability, body, or appearance of any person. If people appear in the photo, ignore them and talk only about the object.";

#[derive(Debug, Clone, PartialEq)]
pub enum SchemaKind {
    /// Prose whose first line must follow `first_line`, e.g. `Safety Score: <0-10>/10`.
    FreeText { first_line: String },
    /// A JSON object shaped like `schema`. Only syntax is checked on the way back.
    StructuredJson { schema: Map<String, Value> },
}

impl SchemaKind {
    pub fn name(&self) -> &'static str {
        match self {
            SchemaKind::FreeText { .. } => "free_text",
            SchemaKind::StructuredJson { .. } => "structured_json",
        }
    }

    pub fn is_structured(&self) -> bool {
        matches!(self, SchemaKind::StructuredJson { .. })
    }

    fn shape_clause(&self) -> String {
        match self {
            SchemaKind::FreeText { first_line } => format!(
                "Respond in plain text only: no JSON, no markdown headings.\nThe first line must be exactly in the form `{first_line}`.\nKeep the whole answer under 120 words."
            ),
            SchemaKind::StructuredJson { schema } => {
                let rendered = serde_json::to_string_pretty(&Value::Object(schema.clone()))
                    .unwrap_or_else(|_| "{}".to_string());
                format!(
                    "Respond with JSON only (no markdown, no prose outside JSON, no trailing commas) using this shape:\n{rendered}"
                )
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PromptSpec {
    pub mode: Mode,
    pub label: String,
    pub system_instructions: String,
    pub expected: SchemaKind,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ModeRow {
    label: String,
    shape: String,
    persona: String,
    #[serde(default)]
    first_line: Option<String>,
    #[serde(default)]
    schema: Option<Map<String, Value>>,
}

impl ModeRow {
    fn into_spec(self, mode: Mode) -> Result<PromptSpec> {
        let expected = match self.shape.trim().to_ascii_lowercase().as_str() {
            "text" => {
                let first_line = self
                    .first_line
                    .map(|line| line.trim().to_string())
                    .filter(|line| !line.is_empty())
                    .ok_or_else(|| anyhow!("mode '{mode}' uses the text shape but has no first_line"))?;
                SchemaKind::FreeText { first_line }
            }
            "json" => {
                let schema = self
                    .schema
                    .filter(|schema| !schema.is_empty())
                    .ok_or_else(|| anyhow!("mode '{mode}' uses the json shape but has no schema"))?;
                SchemaKind::StructuredJson { schema }
            }
            other => bail!("mode '{mode}' has unknown shape '{other}' (expected 'text' or 'json')"),
        };

        let persona = self.persona.trim();
        if persona.is_empty() {
            bail!("mode '{mode}' has an empty persona");
        }
        let system_instructions = [
            persona.to_string(),
            CONTENT_SAFETY_CLAUSE.to_string(),
            expected.shape_clause(),
        ]
        .join("\n\n");

        Ok(PromptSpec {
            mode,
            label: self.label.trim().to_string(),
            system_instructions,
            expected,
        })
    }
}

/// Read-only table of prompt specs, one per [`Mode`].
///
/// Built from the embedded `default_modes.json`; an override document may
/// replace individual fields of any mode. Construction fails unless every mode
/// ends up with a complete spec, so lookups never miss afterwards.
#[derive(Debug, Clone)]
pub struct ModeRegistry {
    /// Indexed by `Mode` discriminant, in `Mode::ALL` order.
    specs: [PromptSpec; 4],
}

impl ModeRegistry {
    pub fn new(overrides: Option<&str>) -> Result<Self> {
        let mut rows =
            parse_mode_rows(DEFAULT_MODES_JSON).context("built-in mode table is invalid")?;
        if let Some(raw) = overrides {
            merge_mode_rows(&mut rows, raw).context("mode overrides are invalid")?;
        }

        let mut specs = Vec::with_capacity(Mode::ALL.len());
        for mode in Mode::ALL {
            let row = rows
                .shift_remove(mode.as_str())
                .ok_or_else(|| anyhow!("mode table has no entry for '{mode}'"))?;
            let row: ModeRow = serde_json::from_value(Value::Object(row))
                .with_context(|| format!("mode '{mode}' entry is invalid"))?;
            specs.push(row.into_spec(mode)?);
        }
        if let Some(unknown) = rows.keys().next() {
            bail!("mode table has unknown mode '{unknown}'");
        }
        let specs: [PromptSpec; 4] = specs
            .try_into()
            .map_err(|_| anyhow!("mode table must define exactly {} modes", Mode::ALL.len()))?;
        Ok(Self { specs })
    }

    pub fn from_override_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read modes file {}", path.display()))?;
        Self::new(Some(&raw)).with_context(|| format!("invalid modes file {}", path.display()))
    }

    pub fn get(&self, mode: Mode) -> &PromptSpec {
        &self.specs[mode.index()]
    }

    pub fn list(&self) -> impl Iterator<Item = &PromptSpec> {
        self.specs.iter()
    }
}

fn parse_mode_rows(raw: &str) -> Result<IndexMap<String, Map<String, Value>>> {
    let mut rows = IndexMap::new();
    merge_mode_rows(&mut rows, raw)?;
    Ok(rows)
}

fn merge_mode_rows(rows: &mut IndexMap<String, Map<String, Value>>, raw: &str) -> Result<()> {
    let payload: Value = serde_json::from_str(raw)?;
    let Some(table) = payload.as_object() else {
        bail!("mode table must be a JSON object keyed by mode");
    };
    for (key, row_value) in table {
        let Some(row) = row_value.as_object() else {
            bail!("mode '{key}' must be a JSON object");
        };
        let entry = rows.entry(key.trim().to_ascii_lowercase()).or_default();
        for (field, field_value) in row {
            entry.insert(field.to_string(), field_value.clone());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::fs;

    use super::{ModeRegistry, SchemaKind, CONTENT_SAFETY_CLAUSE};
    use crate::modes::Mode;

    #[test]
    fn every_mode_has_a_distinct_non_empty_spec() -> anyhow::Result<()> {
        let registry = ModeRegistry::new(None)?;
        let mut seen = HashSet::new();
        for mode in Mode::ALL {
            let spec = registry.get(mode);
            assert_eq!(spec.mode, mode);
            assert!(!spec.label.is_empty());
            assert!(!spec.system_instructions.trim().is_empty());
            assert!(spec.system_instructions.contains(CONTENT_SAFETY_CLAUSE));
            assert!(seen.insert(spec.system_instructions.clone()));
        }
        assert_eq!(registry.list().count(), 4);
        Ok(())
    }

    #[test]
    fn builtin_shapes_match_mode_contracts() -> anyhow::Result<()> {
        let registry = ModeRegistry::new(None)?;
        assert!(registry.get(Mode::Dupe).expected.is_structured());
        assert!(registry.get(Mode::Supply).expected.is_structured());
        assert_eq!(
            registry.get(Mode::Safety).expected,
            SchemaKind::FreeText {
                first_line: "Safety Score: <0-10>/10".to_string()
            }
        );
        match &registry.get(Mode::Viral).expected {
            SchemaKind::FreeText { first_line } => assert!(first_line.starts_with("Viral Score")),
            other => panic!("unexpected viral shape: {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn structured_instructions_embed_the_schema() -> anyhow::Result<()> {
        let registry = ModeRegistry::new(None)?;
        let instructions = &registry.get(Mode::Dupe).system_instructions;
        assert!(instructions.contains("Respond with JSON only"));
        assert!(instructions.contains("\"materials\""));
        assert!(instructions.contains("\"roast\""));

        let safety = &registry.get(Mode::Safety).system_instructions;
        assert!(safety.contains("`Safety Score: <0-10>/10`"));
        assert!(!safety.contains("Respond with JSON only"));
        Ok(())
    }

    #[test]
    fn list_follows_mode_order() -> anyhow::Result<()> {
        let registry = ModeRegistry::new(None)?;
        let modes: Vec<Mode> = registry.list().map(|spec| spec.mode).collect();
        assert_eq!(modes, Mode::ALL.to_vec());
        Ok(())
    }

    #[test]
    fn override_file_replaces_single_fields() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("modes.json");
        fs::write(
            &path,
            r#"{"Viral": {"persona": "You are a hype robot.", "label": "Hype"}}"#,
        )?;
        let registry = ModeRegistry::from_override_file(&path)?;
        let viral = registry.get(Mode::Viral);
        assert_eq!(viral.label, "Hype");
        assert!(viral.system_instructions.starts_with("You are a hype robot."));
        assert!(viral.system_instructions.contains("Viral Score"));

        let builtin = ModeRegistry::new(None)?;
        assert_eq!(registry.get(Mode::Dupe), builtin.get(Mode::Dupe));
        Ok(())
    }

    #[test]
    fn override_can_switch_shape() -> anyhow::Result<()> {
        let registry = ModeRegistry::new(Some(
            r#"{"safety": {"shape": "json", "schema": {"score": 0, "risk_level": "low"}}}"#,
        ))?;
        assert!(registry.get(Mode::Safety).expected.is_structured());
        Ok(())
    }

    #[test]
    fn invalid_overrides_are_rejected() {
        let cases = [
            "not json",
            r#"["dupe"]"#,
            r#"{"roast": {"persona": "x"}}"#,
            r#"{"dupe": {"colour": "red"}}"#,
            r#"{"dupe": {"shape": "yaml"}}"#,
            r#"{"viral": {"persona": "   "}}"#,
            r#"{"supply": {"shape": "text"}}"#,
        ];
        for raw in cases {
            assert!(ModeRegistry::new(Some(raw)).is_err(), "accepted: {raw}");
        }
    }

    #[test]
    fn missing_override_file_reports_path() {
        let err = ModeRegistry::from_override_file(std::path::Path::new("/nonexistent/modes.json"))
            .err()
            .map(|err| format!("{err:#}"))
            .unwrap_or_default();
        assert!(err.contains("/nonexistent/modes.json"), "{err}");
    }
}
