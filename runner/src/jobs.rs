use crate::store::RecordKind;
use std::{collections::VecDeque, path::PathBuf};
use thiserror::Error;
use tracing::error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum JobParseError {
    #[error("Unknown switch '{0}'")]
    UnknownSwitch(String),
    #[error("Unknown job '{0}'")]
    UnknownJob(String),
    #[error("'{job}' is missing its {missing}")]
    MissingArgument { job: &'static str, missing: &'static str },
    #[error("'{0}' is not a record kind (package, task, product, content)")]
    InvalidKind(String),
}

/// One unit of CLI driven work
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobDescriptor {
    Task {
        name: String,
        tags: Vec<String>,
    },
    Get {
        kind: RecordKind,
        name: String,
        out: PathBuf,
    },
}

impl JobDescriptor {
    pub fn name(&self) -> &str {
        match self {
            Self::Task { name, .. } | Self::Get { name, .. } => name,
        }
    }
}

/// Jobs in the order they were given, consumed front to back
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobQueue {
    jobs: VecDeque<JobDescriptor>,
}

impl JobQueue {
    /// parse the job words, problems are collected and the offending words skipped
    pub fn parse<I, S>(words: I, tags: &[String]) -> (Self, Vec<JobParseError>)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut words = words.into_iter().map(Into::<String>::into).peekable();
        let mut jobs = VecDeque::new();
        let mut errors = Vec::new();

        while let Some(word) = words.next() {
            match word.as_str() {
                "task" => match words.next_if(|next| !is_job_word(next)) {
                    Some(name) => jobs.push_back(JobDescriptor::Task {
                        name,
                        tags: tags.to_vec(),
                    }),
                    None => errors.push(JobParseError::MissingArgument {
                        job: "task",
                        missing: "name",
                    }),
                },
                "get" => {
                    // record kinds overlap the job words, `get task <name>` is a task export
                    let kind = match words
                        .next_if(|next| next.parse::<RecordKind>().is_ok() || !is_job_word(next))
                    {
                        Some(kind) => kind,
                        None => {
                            errors.push(JobParseError::MissingArgument {
                                job: "get",
                                missing: "record kind",
                            });
                            continue;
                        }
                    };
                    let name = words.next_if(|next| !is_job_word(next));
                    let out = words.next_if(|next| !is_job_word(next));

                    match (kind.parse::<RecordKind>(), name, out) {
                        (Err(_), _, _) => errors.push(JobParseError::InvalidKind(kind)),
                        (Ok(_), None, _) => errors.push(JobParseError::MissingArgument {
                            job: "get",
                            missing: "record name",
                        }),
                        (Ok(_), Some(_), None) => errors.push(JobParseError::MissingArgument {
                            job: "get",
                            missing: "output file",
                        }),
                        (Ok(kind), Some(name), Some(out)) => jobs.push_back(JobDescriptor::Get {
                            kind,
                            name,
                            out: PathBuf::from(out),
                        }),
                    }
                }
                switch if switch.starts_with('-') => {
                    errors.push(JobParseError::UnknownSwitch(switch.to_owned()))
                }
                other => errors.push(JobParseError::UnknownJob(other.to_owned())),
            }
        }

        for error in errors.iter() {
            error!("Skipping job: {error}");
        }

        (Self { jobs }, errors)
    }

    pub fn push(&mut self, job: JobDescriptor) {
        self.jobs.push_back(job);
    }

    pub fn pop(&mut self) -> Option<JobDescriptor> {
        self.jobs.pop_front()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

impl Iterator for JobQueue {
    type Item = JobDescriptor;

    fn next(&mut self) -> Option<Self::Item> {
        self.pop()
    }
}

// words that start a new job (or are a switch) never count as an argument
fn is_job_word(word: &str) -> bool {
    matches!(word, "task" | "get") || word.starts_with('-')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jobs_keep_their_order() {
        let tags = vec!["nightly".to_owned()];
        let (queue, errors) = JobQueue::parse(
            ["task", "grid", "get", "product", "spectrum", "out/spectrum.yaml", "task", "zeta"],
            &tags,
        );

        assert!(errors.is_empty());
        assert_eq!(
            queue.collect::<Vec<_>>(),
            vec![
                JobDescriptor::Task {
                    name: "grid".into(),
                    tags: tags.clone()
                },
                JobDescriptor::Get {
                    kind: RecordKind::Product,
                    name: "spectrum".into(),
                    out: PathBuf::from("out/spectrum.yaml")
                },
                JobDescriptor::Task {
                    name: "zeta".into(),
                    tags
                },
            ]
        );
    }

    #[test]
    fn problems_are_reported_and_skipped() {
        let (queue, errors) = JobQueue::parse(
            [
                "--bogus", "task", "get", "widget", "x", "y", "frobnicate", "task", "grid", "get",
                "task", "name",
            ],
            &[],
        );

        assert_eq!(
            errors,
            vec![
                JobParseError::UnknownSwitch("--bogus".into()),
                JobParseError::MissingArgument {
                    job: "task",
                    missing: "name"
                },
                JobParseError::InvalidKind("widget".into()),
                JobParseError::UnknownJob("frobnicate".into()),
                JobParseError::MissingArgument {
                    job: "get",
                    missing: "output file"
                },
            ]
        );
        assert_eq!(
            queue.map(|job| job.name().to_owned()).collect::<Vec<_>>(),
            vec!["grid"]
        );
    }

    #[test]
    fn get_without_output_is_skipped() {
        let (queue, errors) = JobQueue::parse(["get", "task", "grid", "task", "zeta"], &[]);

        assert_eq!(
            errors,
            vec![JobParseError::MissingArgument {
                job: "get",
                missing: "output file"
            }]
        );
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn get_accepts_every_record_kind() {
        for (word, kind) in [
            ("package", RecordKind::Package),
            ("task", RecordKind::Task),
            ("product", RecordKind::Product),
            ("content", RecordKind::Content),
        ] {
            let (queue, errors) = JobQueue::parse(["get", word, "grid", "grid.yaml"], &[]);

            assert!(errors.is_empty(), "{word}: {errors:?}");
            assert_eq!(
                queue.collect::<Vec<_>>(),
                vec![JobDescriptor::Get {
                    kind,
                    name: "grid".into(),
                    out: PathBuf::from("grid.yaml")
                }],
                "{word}"
            );
        }
    }

    #[test]
    fn get_before_another_job() {
        let (queue, errors) =
            JobQueue::parse(["get", "task", "grid", "grid.yaml", "task", "grid"], &[]);

        assert!(errors.is_empty());
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn get_without_kind_is_skipped() {
        let (queue, errors) = JobQueue::parse(["get", "--force", "task", "grid"], &[]);

        assert_eq!(
            errors,
            vec![
                JobParseError::MissingArgument {
                    job: "get",
                    missing: "record kind"
                },
                JobParseError::UnknownSwitch("--force".into()),
            ]
        );
        assert_eq!(queue.len(), 1);
    }
}
