use crate::{
    protocol::TaskClass,
    tasks::{Configuration, OutputElement, TaskKind, TaskRecord},
};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum CatalogError {
    #[error("Task {task} requires its parent integration task {parent}")]
    MissingParent { task: String, parent: String },
    #[error("Task {task} ({kind}) cannot consume output of {parent} ({parent_kind})")]
    ParentMismatch {
        task: String,
        kind: &'static str,
        parent: String,
        parent_kind: &'static str,
    },
    #[error("Task {task} lists serial {serial} more than once")]
    DuplicateSerial { task: String, serial: u32 },
    #[error("The execution context has no devices")]
    NoDevices,
}

/// Devices (lanes) available to run work items on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Context {
    pub devices: Vec<String>,
}

impl Context {
    pub fn new(devices: Vec<String>) -> Self {
        Self { devices }
    }

    pub fn single() -> Self {
        Self {
            devices: vec!["cpu".to_owned()],
        }
    }

    pub fn lanes(&self) -> usize {
        self.devices.len()
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::single()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ItemPayload {
    Configuration { values: Vec<f64> },
    Element(OutputElement),
}

/// One unit of schedulable work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub serial: u32,
    pub lane: usize,
    pub payload: ItemPayload,
    pub store_background: bool,
    pub store_prefix: bool,
}

/// Predicate used to restrict a catalog to a subset of its items
pub trait Filter {
    fn keep(&self, item: &WorkItem) -> bool;
}

/// keeps everything
#[derive(Debug, Clone, Copy, Default)]
pub struct AllItems;

impl Filter for AllItems {
    fn keep(&self, _item: &WorkItem) -> bool {
        true
    }
}

/// keeps the items whose serials were handed to a worker
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IdFilter {
    serials: BTreeSet<u32>,
}

impl IdFilter {
    pub fn new<I: IntoIterator<Item = u32>>(serials: I) -> Self {
        Self {
            serials: serials.into_iter().collect(),
        }
    }
}

impl Filter for IdFilter {
    fn keep(&self, item: &WorkItem) -> bool {
        self.serials.contains(&item.serial)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkCatalog {
    task: String,
    class: TaskClass,
    items: Vec<WorkItem>,
}

impl WorkCatalog {
    /// build the full catalog in the task's native order
    pub fn build(
        task: &TaskRecord,
        parent: Option<&TaskRecord>,
        context: &Context,
    ) -> Result<Self, CatalogError> {
        if context.lanes() == 0 {
            return Err(CatalogError::NoDevices);
        }

        let items = match &task.task {
            TaskKind::Twopf(integration) | TaskKind::Threepf(integration) => {
                configuration_items(&task.name, &integration.configurations, context)?
            }
            TaskKind::ZetaTwopf(post) | TaskKind::ZetaThreepf(post) | TaskKind::FNL(post) => {
                let parent = match parent {
                    Some(parent) if parent.name == post.parent => parent,
                    _ => {
                        return Err(CatalogError::MissingParent {
                            task: task.name.clone(),
                            parent: post.parent.clone(),
                        })
                    }
                };

                if !task.task.accepts_parent(&parent.task) {
                    return Err(CatalogError::ParentMismatch {
                        task: task.name.clone(),
                        kind: task.task.name(),
                        parent: parent.name.clone(),
                        parent_kind: parent.task.name(),
                    });
                }

                // postintegrations work on exactly the configurations of their parent
                match parent.task.integration() {
                    Some(integration) => {
                        configuration_items(&task.name, &integration.configurations, context)?
                    }
                    None => unreachable!("accepts_parent only admits integration parents"),
                }
            }
            TaskKind::Output(output) => output
                .elements
                .iter()
                .enumerate()
                .map(|(position, element)| WorkItem {
                    serial: position as u32,
                    lane: position % context.lanes(),
                    payload: ItemPayload::Element(element.clone()),
                    store_background: false,
                    store_prefix: false,
                })
                .collect_vec(),
        };

        Ok(Self {
            task: task.name.clone(),
            class: task.class(),
            items,
        })
    }

    /// build the catalog and keep only the items accepted by `filter`
    pub fn filtered<F: Filter>(
        task: &TaskRecord,
        parent: Option<&TaskRecord>,
        context: &Context,
        filter: &F,
    ) -> Result<Self, CatalogError> {
        Self::build(task, parent, context).map(|catalog| catalog.filter(filter))
    }

    /// restrict an existing catalog, preserving relative order
    pub fn filter<F: Filter>(&self, filter: &F) -> Self {
        Self {
            task: self.task.clone(),
            class: self.class,
            items: self
                .items
                .iter()
                .filter(|item| filter.keep(item))
                .cloned()
                .collect(),
        }
    }

    pub fn task(&self) -> &str {
        &self.task
    }

    pub fn class(&self) -> TaskClass {
        self.class
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &WorkItem> {
        self.items.iter()
    }

    pub fn serials(&self) -> Vec<u32> {
        self.items.iter().map(|item| item.serial).collect()
    }

    pub fn get(&self, serial: u32) -> Option<&WorkItem> {
        self.items.iter().find(|item| item.serial == serial)
    }
}

impl<'a> IntoIterator for &'a WorkCatalog {
    type Item = &'a WorkItem;
    type IntoIter = std::slice::Iter<'a, WorkItem>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

fn configuration_items(
    task: &str,
    configurations: &[Configuration],
    context: &Context,
) -> Result<Vec<WorkItem>, CatalogError> {
    if let Some(serial) = configurations
        .iter()
        .map(|configuration| configuration.serial)
        .duplicates()
        .next()
    {
        return Err(CatalogError::DuplicateSerial {
            task: task.to_owned(),
            serial,
        });
    }

    Ok(configurations
        .iter()
        .enumerate()
        .map(|(position, configuration)| WorkItem {
            serial: configuration.serial,
            lane: position % context.lanes(),
            payload: ItemPayload::Configuration {
                values: configuration.values.clone(),
            },
            store_background: configuration.store_background,
            store_prefix: configuration.store_prefix,
        })
        .collect())
}

#[cfg(test)]
#[path = "catalog_test.rs"]
mod catalog_test;
