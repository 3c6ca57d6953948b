//! Built-in migrations creating the coldstore tables

use super::{Migration, SchemaManager};
use crate::executor::DbError;
use sea_query::{ColumnDef, Expr, ForeignKey, ForeignKeyAction, Index, Table};

/// Every built-in migration, in version order.
pub fn builtin() -> Vec<Box<dyn Migration>> {
    vec![
        Box::new(CreateConsignments),
        Box::new(CreateRoomEntries),
        Box::new(CreateGatePasses),
        Box::new(CreateGatePassPickups),
        Box::new(CreateAdminActionLog),
    ]
}

fn drop_if_exists(manager: &SchemaManager<'_>, table: &str) -> Result<(), DbError> {
    manager.drop_table(Table::drop().table(table.to_string()).if_exists().to_owned())
}

pub struct CreateConsignments;

impl Migration for CreateConsignments {
    fn name(&self) -> &str {
        "create_consignments"
    }

    fn version(&self) -> i64 {
        20240301000001
    }

    fn up(&self, manager: &SchemaManager<'_>) -> Result<(), DbError> {
        manager.create_table(
            Table::create()
                .table("consignments")
                .if_not_exists()
                .col(ColumnDef::new("code").text().not_null().primary_key())
                .col(ColumnDef::new("category").text().not_null())
                .col(
                    ColumnDef::new("expected_quantity")
                        .big_integer()
                        .not_null()
                        .check(Expr::col("expected_quantity").gt(0)),
                )
                .col(ColumnDef::new("customer_ref").text().null())
                .col(
                    ColumnDef::new("created_at")
                        .timestamp_with_time_zone()
                        .not_null(),
                )
                .to_owned(),
        )?;
        manager.create_index(
            Index::create()
                .name("idx_consignments_category")
                .table("consignments")
                .col(Expr::col("category"))
                .if_not_exists()
                .to_owned(),
        )
    }

    fn down(&self, manager: &SchemaManager<'_>) -> Result<(), DbError> {
        drop_if_exists(manager, "consignments")
    }
}

/// Allocation rows. `slots` and `breakdown` hold comma-delimited lists.
pub struct CreateRoomEntries;

impl Migration for CreateRoomEntries {
    fn name(&self) -> &str {
        "create_room_entries"
    }

    fn version(&self) -> i64 {
        20240301000002
    }

    fn up(&self, manager: &SchemaManager<'_>) -> Result<(), DbError> {
        manager.create_table(
            Table::create()
                .table("room_entries")
                .if_not_exists()
                .col(
                    ColumnDef::new("id")
                        .big_integer()
                        .not_null()
                        .auto_increment()
                        .primary_key(),
                )
                .col(ColumnDef::new("consignment_code").text().not_null())
                .col(ColumnDef::new("room").text().not_null())
                .col(ColumnDef::new("floor").text().not_null())
                .col(ColumnDef::new("slots").text().not_null())
                .col(
                    ColumnDef::new("quantity")
                        .big_integer()
                        .not_null()
                        .check(Expr::col("quantity").gte(0)),
                )
                .col(ColumnDef::new("breakdown").text().null())
                .col(ColumnDef::new("remark").text().not_null().default(""))
                .col(
                    ColumnDef::new("created_at")
                        .timestamp_with_time_zone()
                        .not_null(),
                )
                .col(
                    ColumnDef::new("updated_at")
                        .timestamp_with_time_zone()
                        .not_null(),
                )
                .to_owned(),
        )?;
        manager.create_index(
            Index::create()
                .name("idx_room_entries_location")
                .table("room_entries")
                .col(Expr::col("consignment_code"))
                .col(Expr::col("room"))
                .col(Expr::col("floor"))
                .if_not_exists()
                .to_owned(),
        )
    }

    fn down(&self, manager: &SchemaManager<'_>) -> Result<(), DbError> {
        drop_if_exists(manager, "room_entries")
    }
}

pub struct CreateGatePasses;

impl Migration for CreateGatePasses {
    fn name(&self) -> &str {
        "create_gate_passes"
    }

    fn version(&self) -> i64 {
        20240301000003
    }

    fn up(&self, manager: &SchemaManager<'_>) -> Result<(), DbError> {
        let timestamp = |name: &str, required: bool| {
            let mut column = ColumnDef::new(name.to_string());
            column.timestamp_with_time_zone();
            if required {
                column.not_null();
            } else {
                column.null();
            }
            column
        };

        manager.create_table(
            Table::create()
                .table("gate_passes")
                .if_not_exists()
                .col(ColumnDef::new("id").uuid().not_null().primary_key())
                .col(ColumnDef::new("consignment_code").text().not_null())
                .col(
                    ColumnDef::new("requested_quantity")
                        .big_integer()
                        .not_null()
                        .check(Expr::col("requested_quantity").gt(0)),
                )
                .col(ColumnDef::new("approved_quantity").big_integer().null())
                .col(ColumnDef::new("final_approved_quantity").big_integer().null())
                .col(ColumnDef::new("gate").text().null())
                .col(ColumnDef::new("status").text().not_null())
                .col(
                    ColumnDef::new("payment_verified")
                        .boolean()
                        .not_null()
                        .default(false),
                )
                .col(ColumnDef::new("payment_amount").decimal_len(14, 2).null())
                .col(
                    ColumnDef::new("total_picked_up")
                        .big_integer()
                        .not_null()
                        .default(0),
                )
                .col(ColumnDef::new("requested_by").text().not_null())
                .col(ColumnDef::new("approved_by").text().null())
                .col(ColumnDef::new("rejection_reason").text().null())
                .col(timestamp("issued_at", true))
                .col(timestamp("expires_at", true))
                .col(timestamp("approved_at", false))
                .col(timestamp("approval_expires_at", false))
                .col(timestamp("completed_at", false))
                .col(timestamp("updated_at", true))
                .to_owned(),
        )?;
        manager.create_index(
            Index::create()
                .name("idx_gate_passes_status")
                .table("gate_passes")
                .col(Expr::col("status"))
                .if_not_exists()
                .to_owned(),
        )?;
        manager.create_index(
            Index::create()
                .name("idx_gate_passes_consignment")
                .table("gate_passes")
                .col(Expr::col("consignment_code"))
                .if_not_exists()
                .to_owned(),
        )
    }

    fn down(&self, manager: &SchemaManager<'_>) -> Result<(), DbError> {
        drop_if_exists(manager, "gate_passes")
    }
}

pub struct CreateGatePassPickups;

impl Migration for CreateGatePassPickups {
    fn name(&self) -> &str {
        "create_gate_pass_pickups"
    }

    fn version(&self) -> i64 {
        20240301000004
    }

    fn up(&self, manager: &SchemaManager<'_>) -> Result<(), DbError> {
        manager.create_table(
            Table::create()
                .table("gate_pass_pickups")
                .if_not_exists()
                .col(ColumnDef::new("id").uuid().not_null().primary_key())
                .col(ColumnDef::new("gate_pass_id").uuid().not_null())
                .col(
                    ColumnDef::new("quantity")
                        .big_integer()
                        .not_null()
                        .check(Expr::col("quantity").gt(0)),
                )
                .col(ColumnDef::new("room").text().not_null())
                .col(ColumnDef::new("floor").text().not_null())
                .col(ColumnDef::new("slot").text().null())
                .col(
                    ColumnDef::new("picked_at")
                        .timestamp_with_time_zone()
                        .not_null(),
                )
                .col(ColumnDef::new("picked_by").text().not_null())
                .foreign_key(
                    ForeignKey::create()
                        .name("fk_gate_pass_pickups_gate_pass")
                        .from("gate_pass_pickups", "gate_pass_id")
                        .to("gate_passes", "id")
                        .on_delete(ForeignKeyAction::Restrict),
                )
                .to_owned(),
        )?;
        manager.create_index(
            Index::create()
                .name("idx_gate_pass_pickups_gate_pass")
                .table("gate_pass_pickups")
                .col(Expr::col("gate_pass_id"))
                .if_not_exists()
                .to_owned(),
        )
    }

    fn down(&self, manager: &SchemaManager<'_>) -> Result<(), DbError> {
        drop_if_exists(manager, "gate_pass_pickups")
    }
}

pub struct CreateAdminActionLog;

impl Migration for CreateAdminActionLog {
    fn name(&self) -> &str {
        "create_admin_action_log"
    }

    fn version(&self) -> i64 {
        20240301000005
    }

    fn up(&self, manager: &SchemaManager<'_>) -> Result<(), DbError> {
        manager.create_table(
            Table::create()
                .table("admin_action_log")
                .if_not_exists()
                .col(
                    ColumnDef::new("id")
                        .big_integer()
                        .not_null()
                        .auto_increment()
                        .primary_key(),
                )
                .col(ColumnDef::new("actor").text().not_null())
                .col(ColumnDef::new("action").text().not_null())
                .col(ColumnDef::new("description").text().not_null())
                .col(ColumnDef::new("details").json_binary().null())
                .col(
                    ColumnDef::new("created_at")
                        .timestamp_with_time_zone()
                        .not_null(),
                )
                .to_owned(),
        )
    }

    fn down(&self, manager: &SchemaManager<'_>) -> Result<(), DbError> {
        drop_if_exists(manager, "admin_action_log")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_builtin_versions_are_unique_and_ordered() {
        let migrations = builtin();
        let versions: Vec<i64> = migrations.iter().map(|m| m.version()).collect();
        let mut sorted = versions.clone();
        sorted.sort_unstable();
        assert_eq!(versions, sorted);
        assert_eq!(versions.iter().collect::<HashSet<_>>().len(), versions.len());
    }
}
