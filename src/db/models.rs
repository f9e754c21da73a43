//! Trained model artifacts and their evaluation history.

use anyhow::Result;
use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;
use std::path::PathBuf;

use super::{now_timestamp, Database};

#[derive(Debug, Clone, Serialize)]
pub struct ModelRecord {
    pub id: i64,
    pub name: String,
    pub path: PathBuf,
    pub training_time: String,
    pub training_data_size: i64,
    pub accuracy: Option<f64>,
    pub precision: Option<f64>,
    pub recall: Option<f64>,
    /// SHA-256 of the artifact file, hex encoded.
    pub checksum: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewModel {
    pub name: String,
    pub path: PathBuf,
    pub training_data_size: i64,
    pub accuracy: Option<f64>,
    pub precision: Option<f64>,
    pub recall: Option<f64>,
    pub checksum: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EvaluationRecord {
    pub id: i64,
    pub model_id: i64,
    pub media_id: i64,
    pub evaluation_time: String,
    pub correct_predictions: i64,
    pub total_predictions: i64,
    pub accuracy: f64,
}

#[derive(Debug, Clone)]
pub struct NewEvaluation {
    pub model_id: i64,
    pub media_id: i64,
    pub correct_predictions: i64,
    pub total_predictions: i64,
    pub accuracy: f64,
}

const MODEL_COLUMNS: &str = "id, model_name, model_path, training_time, training_data_size, \
                             accuracy, precision, recall, checksum";

fn row_to_model(row: &Row<'_>) -> rusqlite::Result<ModelRecord> {
    Ok(ModelRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        path: PathBuf::from(row.get::<_, String>(2)?),
        training_time: row.get(3)?,
        training_data_size: row.get(4)?,
        accuracy: row.get(5)?,
        precision: row.get(6)?,
        recall: row.get(7)?,
        checksum: row.get(8)?,
    })
}

fn row_to_evaluation(row: &Row<'_>) -> rusqlite::Result<EvaluationRecord> {
    Ok(EvaluationRecord {
        id: row.get(0)?,
        model_id: row.get(1)?,
        media_id: row.get(2)?,
        evaluation_time: row.get(3)?,
        correct_predictions: row.get(4)?,
        total_predictions: row.get(5)?,
        accuracy: row.get(6)?,
    })
}

impl Database {
    pub fn insert_model(&self, model: &NewModel) -> Result<i64> {
        self.conn.execute(
            r#"
            INSERT INTO models (model_name, model_path, training_time, training_data_size,
                                accuracy, precision, recall, checksum)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            params![
                model.name,
                model.path.to_string_lossy(),
                now_timestamp(),
                model.training_data_size,
                model.accuracy,
                model.precision,
                model.recall,
                model.checksum,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn get_model(&self, id: i64) -> Result<Option<ModelRecord>> {
        let sql = format!("SELECT {MODEL_COLUMNS} FROM models WHERE id = ?");
        Ok(self.conn.query_row(&sql, [id], row_to_model).optional()?)
    }

    /// All models, most recently trained first.
    pub fn list_models(&self) -> Result<Vec<ModelRecord>> {
        let sql = format!("SELECT {MODEL_COLUMNS} FROM models ORDER BY training_time DESC, id DESC");
        let mut stmt = self.conn.prepare(&sql)?;
        let models = stmt
            .query_map([], row_to_model)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(models)
    }

    pub fn latest_model(&self) -> Result<Option<ModelRecord>> {
        let sql = format!(
            "SELECT {MODEL_COLUMNS} FROM models ORDER BY training_time DESC, id DESC LIMIT 1"
        );
        Ok(self.conn.query_row(&sql, [], row_to_model).optional()?)
    }

    pub fn count_models(&self) -> Result<i64> {
        Ok(self
            .conn
            .query_row("SELECT COUNT(*) FROM models", [], |row| row.get(0))?)
    }

    pub fn insert_evaluation(&self, evaluation: &NewEvaluation) -> Result<i64> {
        self.conn.execute(
            r#"
            INSERT INTO evaluations (model_id, media_id, evaluation_time,
                                     correct_predictions, total_predictions, accuracy)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
            params![
                evaluation.model_id,
                evaluation.media_id,
                now_timestamp(),
                evaluation.correct_predictions,
                evaluation.total_predictions,
                evaluation.accuracy,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Evaluation history for a model, newest first.
    pub fn evaluations_for_model(&self, model_id: i64) -> Result<Vec<EvaluationRecord>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, model_id, media_id, evaluation_time,
                   correct_predictions, total_predictions, accuracy
            FROM evaluations
            WHERE model_id = ?
            ORDER BY evaluation_time DESC, id DESC
            "#,
        )?;
        let evaluations = stmt
            .query_map([model_id], row_to_evaluation)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(evaluations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MediaKind;
    use std::path::Path;

    fn new_model(name: &str, accuracy: f64) -> NewModel {
        NewModel {
            name: name.to_string(),
            path: PathBuf::from(format!("models/{name}.json")),
            training_data_size: 10,
            accuracy: Some(accuracy),
            precision: Some(0.5),
            recall: None,
            checksum: Some("abc".to_string()),
        }
    }

    #[test]
    fn test_latest_model_is_most_recent() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.latest_model().unwrap().is_none());

        db.insert_model(&new_model("first", 0.5)).unwrap();
        let second = db.insert_model(&new_model("second", 0.75)).unwrap();

        let latest = db.latest_model().unwrap().unwrap();
        assert_eq!(latest.id, second);
        assert_eq!(latest.accuracy, Some(0.75));
        assert_eq!(latest.checksum.as_deref(), Some("abc"));
        assert_eq!(db.count_models().unwrap(), 2);
        assert_eq!(db.list_models().unwrap()[0].name, "second");
    }

    #[test]
    fn test_evaluations_are_appended() {
        let db = Database::open_in_memory().unwrap();
        let model = db.insert_model(&new_model("m", 0.5)).unwrap();
        let media = db
            .insert_media("lesson.jpg", Path::new("uploads/lesson.jpg"), MediaKind::Image)
            .unwrap();
        for correct in [1, 2] {
            db.insert_evaluation(&NewEvaluation {
                model_id: model,
                media_id: media,
                correct_predictions: correct,
                total_predictions: 2,
                accuracy: correct as f64 / 2.0,
            })
            .unwrap();
        }

        let history = db.evaluations_for_model(model).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].correct_predictions, 2);
        assert_eq!(history[1].correct_predictions, 1);
    }
}
