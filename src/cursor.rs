//! Lazy result streams and scrollable cursors.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_stream::try_stream;
use futures::{Stream, StreamExt, TryStreamExt};
use sqlx::AnyConnection;
use tracing::trace;

use crate::engine::{BoundStatement, build_query};
use crate::error::{ExecutionError, OqlError};
use crate::hydrate::{Hydrator, QueryResult};
use crate::plan::CompiledPlan;

type ResultStream<'a> = Pin<Box<dyn Stream<Item = Result<QueryResult, OqlError>> + Send + 'a>>;

/// Results pulled from the database one row at a time.
///
/// The underlying cursor stays open on the borrowed connection until the
/// stream is exhausted, closed or dropped.
pub struct ResultIter<'a> {
    inner: Option<ResultStream<'a>>,
}

impl<'a> ResultIter<'a> {
    pub(crate) fn new(
        conn: &'a mut AnyConnection,
        plan: Arc<CompiledPlan>,
        statement: BoundStatement,
    ) -> Self {
        Self {
            inner: Some(Box::pin(rows(conn, plan, statement))),
        }
    }

    /// Next result, or `None` once exhausted.
    pub async fn next_result(&mut self) -> Result<Option<QueryResult>, OqlError> {
        match self.inner.as_mut() {
            Some(stream) => stream.try_next().await,
            None => Ok(None),
        }
    }

    /// Release the cursor. Further reads return nothing.
    pub fn close(&mut self) {
        if self.inner.take().is_some() {
            trace!("result stream closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_none()
    }
}

impl Stream for ResultIter<'_> {
    type Item = Result<QueryResult, OqlError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.inner.as_mut() {
            Some(stream) => stream.poll_next_unpin(cx),
            None => Poll::Ready(None),
        }
    }
}

fn rows<'a>(
    conn: &'a mut AnyConnection,
    plan: Arc<CompiledPlan>,
    statement: BoundStatement,
) -> impl Stream<Item = Result<QueryResult, OqlError>> + Send + 'a {
    try_stream! {
        let hydrator = Hydrator::new(&plan);
        let mut rows = build_query(&statement).fetch(&mut *conn);
        while let Some(row) = rows
            .try_next()
            .await
            .map_err(|e| OqlError::from(ExecutionError::statement(&statement.sql, e)))?
        {
            yield hydrator.row(&row)?;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Position {
    BeforeFirst,
    At(usize),
    AfterLast,
}

/// A cursor that can move in both directions.
///
/// Rows are fetched when the cursor first moves past them and kept, so
/// moving backwards never touches the database. Row numbers are 0-based.
pub struct ScrollableResults<'a> {
    source: ResultIter<'a>,
    rows: Vec<QueryResult>,
    exhausted: bool,
    position: Position,
}

impl<'a> ScrollableResults<'a> {
    pub(crate) fn new(source: ResultIter<'a>) -> Self {
        Self {
            source,
            rows: Vec::new(),
            exhausted: false,
            position: Position::BeforeFirst,
        }
    }

    /// Pull rows until `index` is buffered or the source runs out.
    async fn fill_to(&mut self, index: usize) -> Result<bool, OqlError> {
        while self.rows.len() <= index && !self.exhausted {
            match self.source.next_result().await? {
                Some(row) => self.rows.push(row),
                None => self.exhausted = true,
            }
        }
        Ok(index < self.rows.len())
    }

    async fn fill_all(&mut self) -> Result<(), OqlError> {
        while !self.exhausted {
            match self.source.next_result().await? {
                Some(row) => self.rows.push(row),
                None => self.exhausted = true,
            }
        }
        Ok(())
    }

    /// Move to `index`, or past the end when it does not exist.
    async fn move_to(&mut self, index: i64) -> Result<bool, OqlError> {
        if index < 0 {
            self.position = Position::BeforeFirst;
            return Ok(false);
        }
        let index = index as usize;
        if self.fill_to(index).await? {
            self.position = Position::At(index);
            Ok(true)
        } else {
            self.position = Position::AfterLast;
            Ok(false)
        }
    }

    fn current_index(&self) -> i64 {
        match self.position {
            Position::BeforeFirst => -1,
            Position::At(index) => index as i64,
            Position::AfterLast => self.rows.len() as i64,
        }
    }

    pub async fn next(&mut self) -> Result<bool, OqlError> {
        if self.position == Position::AfterLast {
            return Ok(false);
        }
        self.move_to(self.current_index() + 1).await
    }

    pub async fn previous(&mut self) -> Result<bool, OqlError> {
        if self.position == Position::AfterLast {
            self.fill_all().await?;
        }
        self.move_to(self.current_index() - 1).await
    }

    pub async fn first(&mut self) -> Result<bool, OqlError> {
        self.move_to(0).await
    }

    pub async fn last(&mut self) -> Result<bool, OqlError> {
        self.fill_all().await?;
        if self.rows.is_empty() {
            self.position = Position::AfterLast;
            return Ok(false);
        }
        self.position = Position::At(self.rows.len() - 1);
        Ok(true)
    }

    pub fn before_first(&mut self) {
        self.position = Position::BeforeFirst;
    }

    /// Position after the last row. Reads the remaining rows.
    pub async fn after_last(&mut self) -> Result<(), OqlError> {
        self.fill_all().await?;
        self.position = Position::AfterLast;
        Ok(())
    }

    /// Move `offset` rows relative to the current position.
    pub async fn scroll(&mut self, offset: i64) -> Result<bool, OqlError> {
        if self.position == Position::AfterLast && offset < 0 {
            self.fill_all().await?;
        }
        self.move_to(self.current_index() + offset).await
    }

    /// Move to an absolute row; negative numbers count from the end, `-1`
    /// being the last row.
    pub async fn set_row_number(&mut self, row: i64) -> Result<bool, OqlError> {
        if row >= 0 {
            return self.move_to(row).await;
        }
        self.fill_all().await?;
        let index = self.rows.len() as i64 + row;
        if index < 0 {
            self.position = Position::BeforeFirst;
            return Ok(false);
        }
        self.move_to(index).await
    }

    /// The current row.
    pub fn get(&self) -> Option<&QueryResult> {
        match self.position {
            Position::At(index) => self.rows.get(index),
            _ => None,
        }
    }

    /// 0-based number of the current row.
    pub fn row_number(&self) -> Option<usize> {
        match self.position {
            Position::At(index) => Some(index),
            _ => None,
        }
    }

    pub fn is_first(&self) -> bool {
        self.position == Position::At(0)
    }

    pub async fn is_last(&mut self) -> Result<bool, OqlError> {
        let Position::At(index) = self.position else {
            return Ok(false);
        };
        Ok(!self.fill_to(index + 1).await?)
    }

    /// Release the cursor and the buffered rows.
    pub fn close(&mut self) {
        self.source.close();
        self.exhausted = true;
        self.rows.clear();
        self.position = Position::AfterLast;
    }
}
