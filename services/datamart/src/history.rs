//! Daily run gating against public.hist_bases.
//!
//! A named job may run at most once successfully per calendar day; failed
//! runs may retry up to [`RETRY_LIMIT`] attempts. The decision itself is a
//! pure function over the day's history rows so it can be tested without a
//! database.

use anyhow::{Context, Result};
use chrono::{NaiveDate, NaiveDateTime};

use crate::db::{Database, Value};

/// Maximum attempt number that is still allowed to retry.
pub const RETRY_LIMIT: i32 = 3;

pub const HIST_TABLE: &str = "public.hist_bases";

/// One prior attempt of the job on the reference day.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct HistAttempt {
    pub tentativa: i32,
    pub concluido: bool,
}

/// Gate decision: whether the job may run now and the attempt counter the
/// caller should record with the outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunPermit {
    pub permitted: bool,
    pub attempt: i32,
}

/// Decide from today's history rows (in timestamp order) whether the job
/// may run.
pub fn evaluate_attempts(attempts: &[HistAttempt], retry_limit: i32) -> RunPermit {
    if attempts.is_empty() {
        return RunPermit {
            permitted: true,
            attempt: 0,
        };
    }
    if attempts.iter().any(|a| a.concluido) {
        return RunPermit {
            permitted: false,
            attempt: 0,
        };
    }
    // All attempts failed so far; the latest one carries the counter.
    let latest = attempts.last().map(|a| a.tentativa).unwrap_or(0);
    RunPermit {
        permitted: latest <= retry_limit,
        attempt: latest,
    }
}

/// Query hist_bases for the job's attempts since today's midnight and
/// evaluate the gate.
pub async fn check_run_permit(
    db: &Database,
    nome_do_relatorio: &str,
    today: NaiveDate,
) -> Result<RunPermit> {
    let midnight = today
        .and_hms_opt(0, 0, 0)
        .context("invalid midnight for reference date")?;
    let sql = format!(
        "SELECT tentativa, concluido FROM {HIST_TABLE} \
         WHERE nome_do_relatorio = $1 AND carimbo_tempo >= $2 \
         ORDER BY carimbo_tempo"
    );
    let attempts: Vec<HistAttempt> = db
        .fetch_all(
            &sql,
            &[
                Value::Text(nome_do_relatorio.to_string()),
                Value::Timestamp(midnight),
            ],
        )
        .await
        .with_context(|| format!("failed to query {HIST_TABLE} for '{nome_do_relatorio}'"))?;
    Ok(evaluate_attempts(&attempts, RETRY_LIMIT))
}

/// Outcome of one job invocation, persisted as a history row.
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub nome_do_relatorio: String,
    pub carimbo_tempo: NaiveDateTime,
    pub tempo_de_extracao_seg: f64,
    pub concluido: bool,
    pub tentativa: i32,
    pub msg_erro: Option<String>,
}

pub async fn record_run(db: &Database, record: &RunRecord) -> Result<()> {
    let sql = format!(
        "INSERT INTO {HIST_TABLE} \
         (carimbo_tempo, nome_do_relatorio, tempo_de_extracao_seg, concluido, tentativa, msg_erro) \
         VALUES ($1, $2, $3, $4, $5, $6)"
    );
    let msg_erro = match &record.msg_erro {
        Some(msg) => Value::Text(msg.clone()),
        None => Value::Null,
    };
    db.execute(
        &sql,
        &[
            Value::Timestamp(record.carimbo_tempo),
            Value::Text(record.nome_do_relatorio.clone()),
            Value::Float(record.tempo_de_extracao_seg),
            Value::Bool(record.concluido),
            Value::Int(record.tentativa as i64),
            msg_erro,
        ],
    )
    .await
    .with_context(|| {
        format!(
            "failed to record run of '{}' in {HIST_TABLE}",
            record.nome_do_relatorio
        )
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attempt(tentativa: i32, concluido: bool) -> HistAttempt {
        HistAttempt {
            tentativa,
            concluido,
        }
    }

    #[test]
    fn first_run_of_the_day_is_permitted() {
        let permit = evaluate_attempts(&[], RETRY_LIMIT);
        assert_eq!(
            permit,
            RunPermit {
                permitted: true,
                attempt: 0
            }
        );
    }

    #[test]
    fn success_today_refuses_regardless_of_attempts() {
        let rows = vec![attempt(1, false), attempt(2, true)];
        assert!(!evaluate_attempts(&rows, RETRY_LIMIT).permitted);

        let rows = vec![attempt(1, true)];
        assert!(!evaluate_attempts(&rows, RETRY_LIMIT).permitted);
    }

    #[test]
    fn two_failures_with_ceiling_three_permits_with_counter_two() {
        let rows = vec![attempt(1, false), attempt(2, false)];
        let permit = evaluate_attempts(&rows, 3);
        assert_eq!(
            permit,
            RunPermit {
                permitted: true,
                attempt: 2
            }
        );
    }

    #[test]
    fn exhausted_attempts_refuse() {
        let rows = vec![
            attempt(1, false),
            attempt(2, false),
            attempt(3, false),
            attempt(4, false),
        ];
        let permit = evaluate_attempts(&rows, 3);
        assert!(!permit.permitted);
        assert_eq!(permit.attempt, 4);
    }

    #[test]
    fn attempt_at_the_ceiling_still_retries() {
        let rows = vec![attempt(3, false)];
        let permit = evaluate_attempts(&rows, 3);
        assert!(permit.permitted);
        assert_eq!(permit.attempt, 3);
    }
}
