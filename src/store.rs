use serde::Serialize;
use sqlx::prelude::FromRow;

/// Payload for one append-only `prediction_logs` row.
///
/// `id` and `timestamp` are generated by the store at insert time;
/// nothing ever updates or deletes a row afterwards.
#[derive(Debug, Clone)]
pub struct NewPredictionLog {
    pub file_name: String,
    /// Distinct detected labels joined by `", "`, in first-seen order.
    /// The join order is not canonicalized, so the dashboard groups two
    /// requests together only when their discovery order matches.
    pub detected_objects: String,
    pub total_objects: i32,
    pub file_path: String,
}

/// One dashboard aggregate row: a literal `detected_objects` value and
/// how many requests produced it.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct ClassCount {
    pub label: String,
    pub count: i64,
}

#[async_trait::async_trait]
pub trait PredictionStore: Send + Sync {
    async fn insert(&self, log: NewPredictionLog) -> anyhow::Result<i32>;

    async fn total_predictions(&self) -> anyhow::Result<i64>;

    async fn class_counts(&self) -> anyhow::Result<Vec<ClassCount>>;
}

#[derive(Clone)]
pub struct PgPredictionStore {
    pool: sqlx::PgPool,
}

impl PgPredictionStore {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let pool = sqlx::PgPool::connect(url).await?;

        Ok(Self::new(pool))
    }
}

#[async_trait::async_trait]
impl PredictionStore for PgPredictionStore {
    #[tracing::instrument(skip(self))]
    async fn insert(&self, log: NewPredictionLog) -> anyhow::Result<i32> {
        let (id,): (i32,) = sqlx::query_as(
            r#"
            INSERT INTO prediction_logs (file_name, detected_objects, total_objects, file_path)
            VALUES ($1, $2, $3, $4)
            RETURNING id
            "#,
        )
        .bind(&log.file_name)
        .bind(&log.detected_objects)
        .bind(log.total_objects)
        .bind(&log.file_path)
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    async fn total_predictions(&self) -> anyhow::Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM prediction_logs")
            .fetch_one(&self.pool)
            .await?;

        Ok(count)
    }

    async fn class_counts(&self) -> anyhow::Result<Vec<ClassCount>> {
        let counts = sqlx::query_as::<_, ClassCount>(
            r#"
            SELECT detected_objects AS label, COUNT(*) AS count
            FROM prediction_logs
            GROUP BY detected_objects
            ORDER BY count DESC, label ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(counts)
    }
}

/// In-memory store used by the route tests.
#[cfg(test)]
pub struct MemoryStore {
    rows: std::sync::Mutex<Vec<NewPredictionLog>>,
}

#[cfg(test)]
impl MemoryStore {
    pub fn new() -> Self {
        Self {
            rows: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn rows(&self) -> Vec<NewPredictionLog> {
        self.rows.lock().unwrap().clone()
    }
}

#[cfg(test)]
#[async_trait::async_trait]
impl PredictionStore for MemoryStore {
    async fn insert(&self, log: NewPredictionLog) -> anyhow::Result<i32> {
        let mut rows = self.rows.lock().unwrap();
        rows.push(log);

        Ok(rows.len() as i32)
    }

    async fn total_predictions(&self) -> anyhow::Result<i64> {
        Ok(self.rows.lock().unwrap().len() as i64)
    }

    async fn class_counts(&self) -> anyhow::Result<Vec<ClassCount>> {
        let rows = self.rows.lock().unwrap();

        let mut counts: Vec<ClassCount> = Vec::new();
        for row in rows.iter() {
            match counts.iter_mut().find(|c| c.label == row.detected_objects) {
                Some(count) => count.count += 1,
                None => counts.push(ClassCount {
                    label: row.detected_objects.clone(),
                    count: 1,
                }),
            }
        }

        Ok(counts)
    }
}

/// A store whose insert always fails, for exercising cleanup paths.
#[cfg(test)]
pub struct FailingStore;

#[cfg(test)]
#[async_trait::async_trait]
impl PredictionStore for FailingStore {
    async fn insert(&self, _log: NewPredictionLog) -> anyhow::Result<i32> {
        anyhow::bail!("connection reset by peer")
    }

    async fn total_predictions(&self) -> anyhow::Result<i64> {
        anyhow::bail!("connection reset by peer")
    }

    async fn class_counts(&self) -> anyhow::Result<Vec<ClassCount>> {
        anyhow::bail!("connection reset by peer")
    }
}
