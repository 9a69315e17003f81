//! Pre-submit answer validation.
//!
//! Runs synchronously before a submit is attempted so that empty or
//! too-short answers are reported per field and never reach the async
//! submit path.

use thiserror::Error;

use crate::model::WorkflowQuestion;

/// Minimum trimmed answer length accepted by default.
pub const DEFAULT_MIN_ANSWER_LEN: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AnswerError {
    #[error("question '{question_id}' has no answer")]
    Empty { question_id: String },

    #[error("answer to '{question_id}' is too short ({len} < {min} characters)")]
    TooShort {
        question_id: String,
        len: usize,
        min: usize,
    },
}

impl AnswerError {
    pub fn question_id(&self) -> &str {
        match self {
            AnswerError::Empty { question_id } | AnswerError::TooShort { question_id, .. } => question_id,
        }
    }
}

/// Validate every answer; an empty result means the draft may be submitted.
pub fn validate_answers(questions: &[WorkflowQuestion], min_len: usize) -> Vec<AnswerError> {
    questions
        .iter()
        .filter_map(|q| {
            let len = q.answer.trim().chars().count();
            if len == 0 {
                Some(AnswerError::Empty {
                    question_id: q.id.clone(),
                })
            } else if len < min_len {
                Some(AnswerError::TooShort {
                    question_id: q.id.clone(),
                    len,
                    min: min_len,
                })
            } else {
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn question(id: &str, answer: &str) -> WorkflowQuestion {
        WorkflowQuestion {
            id: id.into(),
            question: String::new(),
            answer: answer.into(),
        }
    }

    #[test]
    fn test_reports_per_field() {
        let questions = vec![question("q1", "  "), question("q2", "ok"), question("q3", "fine answer")];
        let errors = validate_answers(&questions, DEFAULT_MIN_ANSWER_LEN);

        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].question_id(), "q1");
        assert!(matches!(errors[1], AnswerError::TooShort { len: 2, min: 3, .. }));
    }

    #[test]
    fn test_all_valid() {
        let questions = vec![question("q1", "weekly invoices")];
        assert!(validate_answers(&questions, DEFAULT_MIN_ANSWER_LEN).is_empty());
    }
}
