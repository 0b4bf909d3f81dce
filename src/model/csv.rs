//! CSV persistence of the config entities (groups, chargers, tags).
//!
//! Files are read at startup and may be re-read (reload) or rewritten
//! (write-through) from the API. Rows are matched by id: reloads update
//! existing entities in place and create missing ones; tags are replaced
//! wholesale.

use std::path::Path;

use serde::Deserialize;
use tracing::info;

use super::store::Store;
use super::tag::{Tag, TagStatus};
use crate::support::errors::ModelError;

#[derive(Debug, Deserialize)]
struct GroupRow {
    group_id: String,
    description: Option<String>,
    max_allocation: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChargerRow {
    charger_id: String,
    alias: String,
    group_id: String,
    no_connectors: Option<u32>,
    priority: Option<i32>,
    description: Option<String>,
    conn_max: Option<f64>,
    auth_sha: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TagRow {
    id_tag: String,
    user_name: Option<String>,
    parent_id_tag: Option<String>,
    description: Option<String>,
    status: Option<String>,
    priority: Option<i32>,
}

/// Read groups: `group_id,description,max_allocation`.
pub fn load_groups(store: &Store, path: &Path) -> Result<(), ModelError> {
    info!(path = %path.display(), "reading groups");
    let mut reader = csv::Reader::from_path(path)?;
    for row in reader.deserialize() {
        let row: GroupRow = row?;
        let exists = store.with_model(|m| m.groups.contains_key(&row.group_id));
        if exists {
            store.update_group(&row.group_id, row.description, row.max_allocation.as_deref())?;
        } else {
            store.add_group(&row.group_id, row.description, row.max_allocation.as_deref())?;
        }
    }
    Ok(())
}

pub fn write_groups(store: &Store, path: &Path) -> Result<(), ModelError> {
    info!(path = %path.display(), "writing groups");
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(["group_id", "description", "max_allocation"])?;
    let rows = store.with_model(|m| {
        let mut groups: Vec<_> = m.groups.values().collect();
        groups.sort_by(|a, b| a.group_id.cmp(&b.group_id));
        groups
            .iter()
            .map(|g| {
                (
                    g.group_id.clone(),
                    g.description.clone().unwrap_or_default(),
                    g.max_allocation
                        .as_ref()
                        .map(|s| s.to_string())
                        .unwrap_or_default(),
                )
            })
            .collect::<Vec<_>>()
    });
    for (group_id, description, max_allocation) in rows {
        writer.write_record([group_id, description, max_allocation])?;
    }
    writer.flush()?;
    Ok(())
}

/// Read chargers:
/// `charger_id,alias,group_id,no_connectors,priority,description,conn_max,auth_sha`.
pub fn load_chargers(store: &Store, path: &Path) -> Result<(), ModelError> {
    info!(path = %path.display(), "reading chargers");
    let mut reader = csv::Reader::from_path(path)?;
    for row in reader.deserialize() {
        let row: ChargerRow = row?;
        let exists = store.with_model(|m| m.chargers.contains_key(&row.charger_id));
        if exists {
            store.update_charger(
                &row.charger_id,
                Some(row.alias),
                row.priority,
                row.description,
                row.conn_max,
            )?;
            if let Some(sha) = row.auth_sha {
                store.set_auth_sha(&row.charger_id, sha)?;
            }
        } else {
            store.add_charger(
                &row.charger_id,
                &row.group_id,
                &row.alias,
                row.no_connectors.unwrap_or(1),
                row.priority.unwrap_or(1),
                row.description,
                row.conn_max,
                row.auth_sha,
            )?;
        }
    }
    Ok(())
}

pub fn write_chargers(store: &Store, path: &Path) -> Result<(), ModelError> {
    info!(path = %path.display(), "writing chargers");
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record([
        "charger_id",
        "alias",
        "group_id",
        "no_connectors",
        "priority",
        "description",
        "conn_max",
        "auth_sha",
    ])?;
    let rows = store.with_model(|m| {
        let mut chargers: Vec<_> = m.chargers.values().collect();
        chargers.sort_by(|a, b| a.charger_id.cmp(&b.charger_id));
        chargers
            .iter()
            .map(|c| {
                [
                    c.charger_id.clone(),
                    c.alias.clone(),
                    c.group_id.clone(),
                    c.connectors.len().to_string(),
                    c.priority.to_string(),
                    c.description.clone().unwrap_or_default(),
                    c.conn_max.to_string(),
                    c.auth_sha.clone().unwrap_or_default(),
                ]
            })
            .collect::<Vec<_>>()
    });
    for row in rows {
        writer.write_record(row)?;
    }
    writer.flush()?;
    Ok(())
}

/// Read tags: `id_tag,user_name,parent_id_tag,description,status,priority`.
/// Replaces the whole tag table.
pub fn load_tags(store: &Store, path: &Path) -> Result<(), ModelError> {
    info!(path = %path.display(), "reading tags");
    let mut reader = csv::Reader::from_path(path)?;
    store.clear_tags();
    let mut count = 0usize;
    for row in reader.deserialize() {
        let row: TagRow = row?;
        let status = match row.status.as_deref() {
            Some("Blocked") => TagStatus::Blocked,
            _ => TagStatus::Activated,
        };
        store.upsert_tag(Tag::new(
            &row.id_tag,
            row.user_name,
            row.parent_id_tag,
            row.description,
            status,
            row.priority,
        ));
        count += 1;
    }
    info!(count, "tags loaded");
    Ok(())
}

pub fn write_tags(store: &Store, path: &Path) -> Result<(), ModelError> {
    info!(path = %path.display(), "writing tags");
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record([
        "id_tag",
        "user_name",
        "parent_id_tag",
        "description",
        "status",
        "priority",
    ])?;
    let rows = store.with_model(|m| {
        let mut tags: Vec<_> = m.tags.values().collect();
        tags.sort_by(|a, b| a.id_tag.cmp(&b.id_tag));
        tags.iter()
            .map(|t| {
                [
                    t.id_tag.clone(),
                    t.user_name.clone().unwrap_or_default(),
                    t.parent_id_tag.clone().unwrap_or_default(),
                    t.description.clone().unwrap_or_default(),
                    match t.status {
                        TagStatus::Activated => "Activated".to_string(),
                        TagStatus::Blocked => "Blocked".to_string(),
                    },
                    t.priority.map(|p| p.to_string()).unwrap_or_default(),
                ]
            })
            .collect::<Vec<_>>()
    });
    for row in rows {
        writer.write_record(row)?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use std::sync::Arc;

    fn temp_path(name: &str) -> std::path::PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("balanz-csv-test-{}-{}", std::process::id(), name));
        path
    }

    #[test]
    fn groups_round_trip() {
        let store = Store::new(Arc::new(AppConfig::default()));
        store
            .add_group("SITE", Some("Main site".into()), Some("00:00-23:59>0=48"))
            .unwrap();
        store.add_group("ORG", None, None).unwrap();

        let path = temp_path("groups.csv");
        write_groups(&store, &path).unwrap();

        let other = Store::new(Arc::new(AppConfig::default()));
        load_groups(&other, &path).unwrap();
        other.with_model(|m| {
            assert_eq!(m.groups.len(), 2);
            assert!(m.groups["SITE"].is_allocation_group());
            assert!(!m.groups["ORG"].is_allocation_group());
            assert_eq!(m.groups["SITE"].description.as_deref(), Some("Main site"));
        });
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn chargers_round_trip_with_blank_fields() {
        let store = Store::new(Arc::new(AppConfig::default()));
        store.add_group("G", None, Some("00:00-23:59>0=48")).unwrap();
        store
            .add_charger("CP-9", "G", "Bay 9", 2, 3, None, None, None)
            .unwrap();

        let path = temp_path("chargers.csv");
        write_chargers(&store, &path).unwrap();

        let other = Store::new(Arc::new(AppConfig::default()));
        other.add_group("G", None, None).unwrap();
        load_chargers(&other, &path).unwrap();
        other.with_model(|m| {
            let c = &m.chargers["CP-9"];
            assert_eq!(c.connectors.len(), 2);
            assert_eq!(c.priority, 3);
            assert!(c.auth_sha.is_none());
        });
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn tags_reload_replaces_the_table() {
        let store = Store::new(Arc::new(AppConfig::default()));
        store.upsert_tag(Tag::new("OLD1", None, None, None, TagStatus::Activated, None));
        store.upsert_tag(Tag::new(
            "KEEP1",
            Some("Keeper".into()),
            None,
            None,
            TagStatus::Blocked,
            Some(5),
        ));

        let path = temp_path("tags.csv");
        write_tags(&store, &path).unwrap();
        store.delete_tag("OLD1").unwrap();
        store.upsert_tag(Tag::new("NEW1", None, None, None, TagStatus::Activated, None));

        load_tags(&store, &path).unwrap();
        store.with_model(|m| {
            assert!(m.tags.contains_key("OLD1"), "reload restores the file contents");
            assert!(!m.tags.contains_key("NEW1"), "reload drops unknown tags");
            let keep = &m.tags["KEEP1"];
            assert_eq!(keep.status, TagStatus::Blocked);
            assert_eq!(keep.priority, Some(5));
        });
        std::fs::remove_file(path).ok();
    }
}
