//! 커스텀 쿼리 스트림
//!
//! 설정의 SQL 템플릿에서 `{db_schema}`를 스키마 이름으로 바꿔 스키마마다 따로 실행합니다.
//! 결과셋 컬럼 메타데이터로 스키마를 추론하고, 스트림 이름은 `<name>-<schema>`입니다.
//! 한 스키마의 실패는 경고로 남기고 나머지는 계속 실행합니다. 상태는 저장하지 않습니다.

use crate::catalog::ColumnSchema;
use crate::config::CustomStreamConfig;
use crate::connection::ConnectionPool;
use crate::error::{CdcError, Result};
use crate::types::{canonical_from_column, row_to_record};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use mysql_async::consts::ColumnFlags;
use mysql_async::prelude::*;
use mysql_async::Row;
use serde_json::{json, Map, Value};
use tracing::{info, warn};

/// 치환된 쿼리 하나
#[derive(Debug, Clone, PartialEq)]
pub struct Substitution {
    pub stream: String,
    pub schema: String,
    pub sql: String,
    pub key_properties: Vec<String>,
}

/// 설정의 커스텀 스트림을 스키마별 쿼리로 펼침
pub fn substitutions(configs: &[CustomStreamConfig]) -> Vec<Substitution> {
    configs
        .iter()
        .flat_map(|config| {
            config.db_schemas.iter().map(move |schema| Substitution {
                stream: config.stream_name(schema),
                schema: schema.clone(),
                sql: config.render_sql(schema),
                key_properties: config.primary_keys.clone(),
            })
        })
        .collect()
}

/// 쿼리 하나의 결과
#[derive(Debug, Clone, PartialEq)]
pub struct CustomResultSet {
    pub stream: String,
    pub key_properties: Vec<String>,
    pub columns: Vec<ColumnSchema>,
    pub rows: Vec<Map<String, Value>>,
}

impl CustomResultSet {
    /// 결과셋 컬럼으로 만든 JSON Schema
    pub fn json_schema(&self) -> Value {
        let properties: Map<String, Value> = self
            .columns
            .iter()
            .map(|c| {
                let nullable = c.nullable && !self.key_properties.contains(&c.name);
                (c.name.clone(), c.canonical.json_schema(nullable))
            })
            .collect();
        json!({ "type": "object", "properties": properties })
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CustomRunSummary {
    pub succeeded: Vec<String>,
    pub failed: Vec<String>,
}

/// SQL 실행기 (풀 연결 또는 테스트용)
#[async_trait]
pub trait QueryRunner: Send + Sync {
    async fn run(&self, sql: &str) -> Result<(Vec<ColumnSchema>, Vec<Map<String, Value>>)>;
}

pub struct PoolRunner<'a> {
    pool: &'a ConnectionPool,
}

impl<'a> PoolRunner<'a> {
    pub fn new(pool: &'a ConnectionPool) -> Self {
        PoolRunner { pool }
    }
}

#[async_trait]
impl<'a> QueryRunner for PoolRunner<'a> {
    async fn run(&self, sql: &str) -> Result<(Vec<ColumnSchema>, Vec<Map<String, Value>>)> {
        let mut conn = self.pool.get_conn().await?;
        let mut result = conn.query_iter(sql).await?;

        let columns: Vec<ColumnSchema> = result
            .columns()
            .map(|columns| {
                columns
                    .iter()
                    .map(|column| ColumnSchema {
                        name: column.name_str().into_owned(),
                        data_type: format!("{:?}", column.column_type()),
                        column_type: String::new(),
                        nullable: !column.flags().contains(ColumnFlags::NOT_NULL_FLAG),
                        canonical: canonical_from_column(column),
                    })
                    .collect()
            })
            .unwrap_or_default();

        let rows: Vec<Row> = result.collect().await?;
        let refs: Vec<&ColumnSchema> = columns.iter().collect();
        let records = rows.iter().map(|row| row_to_record(row, &refs)).collect();
        Ok((columns, records))
    }
}

/// 모든 치환 쿼리를 동시에(`concurrency` 제한) 실행하고 끝나는 순서대로 결과를 `on_result`로 넘김
///
/// 메모리에 남는 결과셋은 최대 `concurrency`개입니다.
/// 쿼리 실패는 해당 스트림만 실패로 기록됩니다. `on_result`의 에러(출력 실패)는 그대로 반환.
pub async fn run_custom_streams<R, F>(
    runner: &R,
    substitutions: Vec<Substitution>,
    concurrency: usize,
    on_result: F,
) -> Result<CustomRunSummary>
where
    R: QueryRunner + ?Sized,
    F: Fn(CustomResultSet) -> Result<()> + Sync,
{
    info!("Running {} custom query streams", substitutions.len());

    let mut outcomes = stream::iter(substitutions)
        .map(|sub| async move {
            let result = runner.run(&sub.sql).await;
            (sub, result)
        })
        .buffer_unordered(concurrency.max(1));

    let mut summary = CustomRunSummary::default();
    while let Some((sub, outcome)) = outcomes.next().await {
        match outcome {
            Ok((columns, rows)) => {
                info!(stream = %sub.stream, "Custom query returned {} rows", rows.len());
                on_result(CustomResultSet {
                    stream: sub.stream.clone(),
                    key_properties: sub.key_properties,
                    columns,
                    rows,
                })?;
                summary.succeeded.push(sub.stream);
            }
            Err(e) => {
                let err = CdcError::CustomQueryError {
                    stream: sub.stream.clone(),
                    message: e.to_string(),
                };
                warn!(stream = %sub.stream, "{}", err);
                summary.failed.push(sub.stream);
            }
        }
    }
    summary.succeeded.sort();
    summary.failed.sort();
    Ok(summary)
}
