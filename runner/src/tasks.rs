use crate::protocol::TaskClass;
use serde::{Deserialize, Serialize};

/// A single parameter configuration of an integration task
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Configuration {
    pub serial: u32,
    pub values: Vec<f64>,
    // background evolution is only written once per run, by the flagged configuration
    #[serde(default)]
    pub store_background: bool,
    #[serde(default)]
    pub store_prefix: bool,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct IntegrationTask {
    pub package: String,
    #[serde(default)]
    pub configurations: Vec<Configuration>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct PostintegrationTask {
    pub parent: String,
    // run the parent integration in the same pass instead of reading committed content
    #[serde(default)]
    pub paired: bool,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct OutputElement {
    pub product: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct OutputTask {
    #[serde(default)]
    pub elements: Vec<OutputElement>,
}

/// All task variants known to the scheduler, dispatched with a single match
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskKind {
    Twopf(IntegrationTask),
    Threepf(IntegrationTask),
    ZetaTwopf(PostintegrationTask),
    ZetaThreepf(PostintegrationTask),
    #[serde(rename = "fnl")]
    FNL(PostintegrationTask),
    Output(OutputTask),
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct TaskRecord {
    pub name: String,
    pub task: TaskKind,
}

impl TaskKind {
    pub fn class(&self) -> TaskClass {
        match self {
            Self::Twopf(_) | Self::Threepf(_) => TaskClass::Integration,
            Self::ZetaTwopf(_) | Self::ZetaThreepf(_) | Self::FNL(_) => TaskClass::Postintegration,
            Self::Output(_) => TaskClass::DerivedContent,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Twopf(_) => "twopf",
            Self::Threepf(_) => "threepf",
            Self::ZetaTwopf(_) => "zeta_twopf",
            Self::ZetaThreepf(_) => "zeta_threepf",
            Self::FNL(_) => "fnl",
            Self::Output(_) => "output",
        }
    }

    pub fn integration(&self) -> Option<&IntegrationTask> {
        match self {
            Self::Twopf(task) | Self::Threepf(task) => Some(task),
            _ => None,
        }
    }

    pub fn postintegration(&self) -> Option<&PostintegrationTask> {
        match self {
            Self::ZetaTwopf(task) | Self::ZetaThreepf(task) | Self::FNL(task) => Some(task),
            _ => None,
        }
    }

    /// check that `parent` is the kind of integration this postintegration can consume
    pub fn accepts_parent(&self, parent: &TaskKind) -> bool {
        matches!(
            (self, parent),
            (Self::ZetaTwopf(_), Self::Twopf(_))
                | (Self::ZetaThreepf(_), Self::Threepf(_))
                | (Self::FNL(_), Self::Threepf(_))
        )
    }
}

impl TaskRecord {
    pub fn class(&self) -> TaskClass {
        self.task.class()
    }

    pub fn parent(&self) -> Option<&str> {
        self.task.postintegration().map(|task| task.parent.as_str())
    }
}
