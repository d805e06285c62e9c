//! Foreign key analysis: relation discovery and deletion ordering.

use crate::adapters::{BackendAdapter, BackendKind};
use crate::error::Result;
use crate::value::SqlValue;
use std::collections::VecDeque;
use tracing::{debug, warn};

/// One foreign key column pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKeyRelation {
    pub constraint_name: String,
    /// Referencing (child) table.
    pub table: String,
    pub column: String,
    /// Referenced (parent) table.
    pub referenced_table: String,
    pub referenced_column: String,
}

/// Result of deletion-order analysis over a set of tables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletionOrder {
    /// Tables in safe deletion order: every referencing table precedes the
    /// tables it references.
    pub order: Vec<String>,
    pub has_circular_reference: bool,
    /// Tables involved in reference cycles, in input order.
    pub circular_tables: Vec<String>,
    /// The relations among the analyzed tables that drove the ordering.
    pub fk_relations: Vec<ForeignKeyRelation>,
}

/// List the foreign key relations visible to a connection.
pub async fn list_relations(
    adapter: &mut (dyn BackendAdapter + '_),
) -> Result<Vec<ForeignKeyRelation>> {
    let sql = match adapter.backend() {
        BackendKind::Mssql => {
            r#"
            SELECT
                fk.name AS constraint_name,
                tp.name AS table_name,
                cp.name AS column_name,
                tr.name AS referenced_table,
                cr.name AS referenced_column
            FROM sys.foreign_keys fk
            JOIN sys.foreign_key_columns fkc
                ON fk.object_id = fkc.constraint_object_id
            JOIN sys.tables tp ON fkc.parent_object_id = tp.object_id
            JOIN sys.columns cp
                ON fkc.parent_object_id = cp.object_id
               AND fkc.parent_column_id = cp.column_id
            JOIN sys.tables tr ON fkc.referenced_object_id = tr.object_id
            JOIN sys.columns cr
                ON fkc.referenced_object_id = cr.object_id
               AND fkc.referenced_column_id = cr.column_id
            ORDER BY fk.name
            "#
        }
        BackendKind::Postgres => {
            r#"
            SELECT
                tc.constraint_name AS constraint_name,
                tc.table_name AS table_name,
                kcu.column_name AS column_name,
                ccu.table_name AS referenced_table,
                ccu.column_name AS referenced_column
            FROM information_schema.table_constraints tc
            JOIN information_schema.key_column_usage kcu
                ON tc.constraint_name = kcu.constraint_name
               AND tc.table_schema = kcu.table_schema
            JOIN information_schema.constraint_column_usage ccu
                ON tc.constraint_name = ccu.constraint_name
               AND tc.table_schema = ccu.table_schema
            WHERE tc.constraint_type = 'FOREIGN KEY'
              AND tc.table_schema = 'public'
            ORDER BY tc.constraint_name
            "#
        }
        BackendKind::Mysql => {
            r#"
            SELECT
                CONSTRAINT_NAME AS constraint_name,
                TABLE_NAME AS table_name,
                COLUMN_NAME AS column_name,
                REFERENCED_TABLE_NAME AS referenced_table,
                REFERENCED_COLUMN_NAME AS referenced_column
            FROM information_schema.KEY_COLUMN_USAGE
            WHERE REFERENCED_TABLE_NAME IS NOT NULL
              AND TABLE_SCHEMA = DATABASE()
            ORDER BY CONSTRAINT_NAME
            "#
        }
    };

    let result = adapter.query(sql, &[]).await?;
    let mut relations = Vec::with_capacity(result.rows.len());
    for row in &result.rows {
        let field = |name: &str| match row.get(name) {
            Some(SqlValue::Text(s)) => Some(s.clone()),
            _ => None,
        };
        let (Some(constraint_name), Some(table), Some(column), Some(referenced_table), Some(referenced_column)) = (
            field("constraint_name"),
            field("table_name"),
            field("column_name"),
            field("referenced_table"),
            field("referenced_column"),
        ) else {
            warn!("skipping malformed foreign key catalog row");
            continue;
        };
        relations.push(ForeignKeyRelation {
            constraint_name,
            table,
            column,
            referenced_table,
            referenced_column,
        });
    }

    debug!(
        db_id = adapter.db_id(),
        relations = relations.len(),
        "listed foreign key relations"
    );
    Ok(relations)
}

/// Compute a safe deletion order over `tables`.
///
/// Kahn's algorithm over the edge "referencing table must be deleted before
/// the table it references". Ties resolve by input order: the initial queue
/// follows `tables`, and tables freed in the same step are enqueued in input
/// order. Tables on a reference cycle cannot be ordered; they are appended
/// at the tail in input order and flagged.
pub fn deletion_order(tables: &[String], relations: &[ForeignKeyRelation]) -> DeletionOrder {
    let canonical = |name: &str| -> Option<usize> {
        tables.iter().position(|t| t.eq_ignore_ascii_case(name))
    };

    // Only relations with both ends inside the analyzed set matter, and
    // self-references never constrain the order.
    let relevant: Vec<ForeignKeyRelation> = relations
        .iter()
        .filter(|r| {
            let child = canonical(&r.table);
            let parent = canonical(&r.referenced_table);
            matches!((child, parent), (Some(c), Some(p)) if c != p)
        })
        .cloned()
        .collect();

    let n = tables.len();
    let mut in_degree = vec![0usize; n];
    let mut children_of: Vec<Vec<usize>> = vec![Vec::new(); n];
    for relation in &relevant {
        let child = canonical(&relation.table).unwrap_or(0);
        let parent = canonical(&relation.referenced_table).unwrap_or(0);
        // Duplicate column pairs of one composite key still mean a single
        // table dependency.
        if !children_of[child].contains(&parent) {
            children_of[child].push(parent);
            in_degree[parent] += 1;
        }
    }

    let mut queue: VecDeque<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(n);
    while let Some(idx) = queue.pop_front() {
        order.push(tables[idx].clone());
        // Scanning ascending keeps same-step discoveries in input order.
        let parents = children_of[idx].clone();
        for parent in (0..n).filter(|p| parents.contains(p)) {
            in_degree[parent] -= 1;
            if in_degree[parent] == 0 {
                queue.push_back(parent);
            }
        }
    }

    let circular_tables: Vec<String> = (0..n)
        .filter(|&i| in_degree[i] > 0)
        .map(|i| tables[i].clone())
        .collect();
    let has_circular_reference = !circular_tables.is_empty();
    if has_circular_reference {
        warn!(
            tables = ?circular_tables,
            "circular foreign key references; ordering is best effort"
        );
        order.extend(circular_tables.iter().cloned());
    }

    DeletionOrder {
        order,
        has_circular_reference,
        circular_tables,
        fk_relations: relevant,
    }
}

/// List relations and compute the deletion order in one step.
pub async fn analyze(
    adapter: &mut (dyn BackendAdapter + '_),
    tables: &[String],
) -> Result<DeletionOrder> {
    let relations = list_relations(adapter).await?;
    Ok(deletion_order(tables, &relations))
}

/// Enable or disable foreign key checking for the session, using the
/// backend's global toggle. The escape hatch when
/// [`DeletionOrder::has_circular_reference`] is set.
pub async fn toggle_constraints(
    adapter: &mut (dyn BackendAdapter + '_),
    enabled: bool,
) -> Result<()> {
    adapter.set_constraints_enabled(enabled).await?;
    debug!(
        db_id = adapter.db_id(),
        enabled, "foreign key checks toggled"
    );
    Ok(())
}
