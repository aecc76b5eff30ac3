//! Scenario catalog loading.
//!
//! The catalog is a JSON object keyed by scenario file name. Each entry carries
//! the scenario's `acquire_position_actions`; the first one is the ego's
//! destination. Catalog order is preserved and is the execution order.
use anyhow::{anyhow, Context, Result};
use serde_json::{Map, Value};
use std::path::Path;

const DESTINATION_KEY: &str = "acquire_position_actions";

/// Destination pose in the scenario's own (OpenDRIVE) convention; heading in radians.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pose {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub heading: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScenarioTask {
    pub id: String,
    /// `None` when the catalog entry lacks a usable destination.
    pub destination: Option<Pose>,
}

#[derive(Debug, Clone, Default)]
pub struct Catalog {
    tasks: Vec<ScenarioTask>,
}

impl Catalog {
    pub fn new(tasks: Vec<ScenarioTask>) -> Self {
        Self { tasks }
    }

    pub fn tasks(&self) -> &[ScenarioTask] {
        &self.tasks
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

/// Read the catalog file. An unreadable or non-object catalog is fatal for the batch.
pub fn load_catalog(path: &Path) -> Result<Catalog> {
    let bytes = std::fs::read(path).with_context(|| format!("read catalog {}", path.display()))?;
    let value: Value = serde_json::from_slice(&bytes)
        .with_context(|| format!("parse catalog {}", path.display()))?;
    let Value::Object(entries) = value else {
        return Err(anyhow!(
            "catalog {} must be a JSON object keyed by scenario id",
            path.display()
        ));
    };
    let tasks = entries
        .into_iter()
        .map(|(id, metadata)| {
            let destination = destination_from_metadata(&id, &metadata);
            ScenarioTask { id, destination }
        })
        .collect::<Vec<_>>();
    tracing::info!(path = %path.display(), scenarios = tasks.len(), "loaded scenario catalog");
    Ok(Catalog::new(tasks))
}

fn destination_from_metadata(id: &str, metadata: &Value) -> Option<Pose> {
    let first = metadata
        .get(DESTINATION_KEY)
        .and_then(Value::as_array)
        .and_then(|actions| actions.first())?;
    let pose = first.as_object().filter(|pose| !pose.is_empty())?;
    match parse_pose(pose) {
        Ok(pose) => Some(pose),
        Err(err) => {
            tracing::warn!(scenario = %id, error = %err, "ignoring malformed destination");
            None
        }
    }
}

fn parse_pose(pose: &Map<String, Value>) -> Result<Pose> {
    Ok(Pose {
        x: number_field(pose, "x")?,
        y: number_field(pose, "y")?,
        z: number_field(pose, "z")?,
        heading: number_field(pose, "h")?,
    })
}

// Catalog producers emit both JSON numbers and numeric strings.
fn number_field(pose: &Map<String, Value>, key: &str) -> Result<f64> {
    let value = pose
        .get(key)
        .ok_or_else(|| anyhow!("destination missing {key:?}"))?;
    let number = match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    };
    number
        .filter(|number| number.is_finite())
        .ok_or_else(|| anyhow!("destination field {key:?} is not a number: {value}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn load_from_str(text: &str) -> Result<Catalog> {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("catalog.json");
        std::fs::write(&path, text).expect("write catalog");
        load_catalog(&path)
    }

    #[test]
    fn first_acquire_position_action_is_the_destination() {
        let catalog = load_from_str(
            r#"{
                "A.xosc": { "acquire_position_actions": [
                    { "x": 10, "y": 0, "z": 0, "h": 0 },
                    { "x": 99, "y": 99, "z": 0, "h": 0 }
                ] }
            }"#,
        )
        .expect("load catalog");
        assert_eq!(catalog.len(), 1);
        let task = &catalog.tasks()[0];
        assert_eq!(task.id, "A.xosc");
        assert_eq!(
            task.destination,
            Some(Pose {
                x: 10.0,
                y: 0.0,
                z: 0.0,
                heading: 0.0
            })
        );
    }

    #[test]
    fn numeric_strings_are_accepted() {
        let catalog = load_from_str(
            r#"{ "B.xosc": { "acquire_position_actions": [
                { "x": "1.5", "y": "-2", "z": "0.25", "h": "3.14" }
            ] } }"#,
        )
        .expect("load catalog");
        let pose = catalog.tasks()[0].destination.expect("destination");
        assert_eq!(pose.x, 1.5);
        assert_eq!(pose.y, -2.0);
    }

    #[test]
    fn missing_or_empty_destinations_yield_none() {
        let catalog = load_from_str(
            r#"{
                "none.xosc": {},
                "empty.xosc": { "acquire_position_actions": [] },
                "null.xosc": { "acquire_position_actions": [null] },
                "blank.xosc": { "acquire_position_actions": [{}] },
                "bad.xosc": { "acquire_position_actions": [{ "x": "east", "y": 0, "z": 0, "h": 0 }] },
                "scalar.xosc": 7
            }"#,
        )
        .expect("load catalog");
        assert_eq!(catalog.len(), 6);
        assert!(catalog.tasks().iter().all(|task| task.destination.is_none()));
    }

    #[test]
    fn catalog_order_is_preserved() {
        let catalog = load_from_str(r#"{ "z.xosc": {}, "a.xosc": {}, "m.xosc": {} }"#)
            .expect("load catalog");
        let ids: Vec<&str> = catalog.tasks().iter().map(|task| task.id.as_str()).collect();
        assert_eq!(ids, vec!["z.xosc", "a.xosc", "m.xosc"]);
    }

    #[test]
    fn non_object_catalog_is_an_error() {
        assert!(load_from_str("[1, 2]").is_err());
        assert!(load_from_str("{ not json").is_err());
    }
}
