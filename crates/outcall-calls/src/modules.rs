use outcall_types::{Module, Question};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::CallError;

/// A question to insert; its order is its position in the list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewQuestion {
    pub text: String,
    #[serde(default = "default_required")]
    pub required: bool,
}

fn default_required() -> bool {
    true
}

/// Parameters for creating a module.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateModuleParams {
    pub id: String,
    pub name: String,
    pub questions: Vec<NewQuestion>,
}

/// Inserts a module together with its questions.
pub fn create_module(conn: &Connection, params: &CreateModuleParams) -> Result<Module, CallError> {
    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "INSERT INTO modules (id, name) VALUES (?1, ?2)",
        params![params.id, params.name],
    )?;
    for (position, question) in params.questions.iter().enumerate() {
        tx.execute(
            "INSERT INTO questions (module_id, position, text, required) VALUES (?1, ?2, ?3, ?4)",
            params![params.id, position as i64, question.text, question.required],
        )?;
    }
    tx.commit()?;

    tracing::info!(
        module_id = %params.id,
        questions = params.questions.len(),
        "module created"
    );
    get_module(conn, &params.id)
}

/// Loads a module with its questions in order.
pub fn get_module(conn: &Connection, module_id: &str) -> Result<Module, CallError> {
    let name: String = conn
        .query_row(
            "SELECT name FROM modules WHERE id = ?1",
            [module_id],
            |row| row.get(0),
        )
        .optional()?
        .ok_or_else(|| CallError::ModuleNotFound(module_id.to_string()))?;

    let mut stmt = conn.prepare(
        "SELECT position, text, required FROM questions
         WHERE module_id = ?1 ORDER BY position ASC",
    )?;
    let rows = stmt.query_map([module_id], |row| {
        Ok(Question {
            order: row.get::<_, i64>(0)? as u32,
            text: row.get(1)?,
            required: row.get(2)?,
        })
    })?;

    let mut questions = Vec::new();
    for row in rows {
        questions.push(row?);
    }

    Ok(Module {
        id: module_id.to_string(),
        name,
        questions,
    })
}
