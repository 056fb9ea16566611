//! Loads the fixed set of Turbine templates from a directory.
//!
//! Either every logical template loads or the run does not proceed; there is
//! no such thing as a partial [`TemplateSet`].

use std::fs;
use std::io;
use std::path::Path;

use crate::document::TemplateDocument;

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum Error {
    #[error("Template file {0} not found")]
    FileNotFound(String),

    #[error("Failed to parse {path}: {message}")]
    ParsingError { path: String, message: String },

    #[error("Unknown error occurred: {0}")]
    Unknown(String),
}

/// The fixed enumeration of documents composing the deployed stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogicalTemplate {
    Master,
    Cluster,
    Webserver,
    Scheduler,
    Workerset,
}

impl LogicalTemplate {
    pub const ALL: [LogicalTemplate; 5] = [
        LogicalTemplate::Master,
        LogicalTemplate::Cluster,
        LogicalTemplate::Webserver,
        LogicalTemplate::Scheduler,
        LogicalTemplate::Workerset,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LogicalTemplate::Master => "master",
            LogicalTemplate::Cluster => "cluster",
            LogicalTemplate::Webserver => "webserver",
            LogicalTemplate::Scheduler => "scheduler",
            LogicalTemplate::Workerset => "workerset",
        }
    }

    pub fn file_name(&self) -> String {
        format!("turbine-{}.template", self.as_str())
    }
}

impl std::fmt::Display for LogicalTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One loaded document per logical template. Having a field per template
/// (instead of a map) makes "all five are present" a type-level fact.
#[derive(Debug, Clone)]
pub struct TemplateSet {
    pub master: TemplateDocument,
    pub cluster: TemplateDocument,
    pub webserver: TemplateDocument,
    pub scheduler: TemplateDocument,
    pub workerset: TemplateDocument,
}

impl TemplateSet {
    pub fn load(templates_path: &Path) -> Result<Self, Error> {
        let load = |template: LogicalTemplate| {
            load_document(&templates_path.join(template.file_name()))
        };
        return Ok(Self {
            master: load(LogicalTemplate::Master)?,
            cluster: load(LogicalTemplate::Cluster)?,
            webserver: load(LogicalTemplate::Webserver)?,
            scheduler: load(LogicalTemplate::Scheduler)?,
            workerset: load(LogicalTemplate::Workerset)?,
        });
    }

    pub fn get(&self, template: LogicalTemplate) -> &TemplateDocument {
        match template {
            LogicalTemplate::Master => &self.master,
            LogicalTemplate::Cluster => &self.cluster,
            LogicalTemplate::Webserver => &self.webserver,
            LogicalTemplate::Scheduler => &self.scheduler,
            LogicalTemplate::Workerset => &self.workerset,
        }
    }

    pub fn get_mut(&mut self, template: LogicalTemplate) -> &mut TemplateDocument {
        match template {
            LogicalTemplate::Master => &mut self.master,
            LogicalTemplate::Cluster => &mut self.cluster,
            LogicalTemplate::Webserver => &mut self.webserver,
            LogicalTemplate::Scheduler => &mut self.scheduler,
            LogicalTemplate::Workerset => &mut self.workerset,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (LogicalTemplate, &TemplateDocument)> {
        LogicalTemplate::ALL
            .into_iter()
            .map(move |template| (template, self.get(template)))
    }
}

fn load_document(path: &Path) -> Result<TemplateDocument, Error> {
    let contents = match fs::read_to_string(path) {
        Ok(raw_contents) => Ok(raw_contents),
        Err(error) => match error.kind() {
            io::ErrorKind::NotFound => Err(Error::FileNotFound(path.display().to_string())),
            _ => Err(Error::Unknown(error.to_string())),
        },
    }?;

    match TemplateDocument::from_yaml_str(&contents) {
        Ok(document) => Ok(document),
        Err(error) => Err(Error::ParsingError {
            path: path.display().to_string(),
            message: error.to_string(),
        }),
    }
}

/// Writes a bare-bones template per logical name, for tests elsewhere in the
/// crate that need a loadable set.
#[cfg(test)]
pub(crate) fn write_minimal_set(dir: &Path) {
    for template in LogicalTemplate::ALL {
        let contents = format!(
            "Description: {name} stack\nParameters: {{}}\nResources: {{}}\nOutputs: {{}}\n",
            name = template.as_str()
        );
        fs::write(dir.join(template.file_name()), contents).unwrap();
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::{write_minimal_set, Error, LogicalTemplate, TemplateSet};

    #[test]
    fn loads_all_five_templates() {
        let dir = tempdir().unwrap();
        write_minimal_set(dir.path());

        let set = TemplateSet::load(dir.path()).unwrap();
        assert_eq!(5, set.iter().count());
    }

    #[test]
    fn one_missing_file_fails_the_whole_load() {
        let dir = tempdir().unwrap();
        write_minimal_set(dir.path());
        std::fs::remove_file(dir.path().join(LogicalTemplate::Scheduler.file_name())).unwrap();

        let result = TemplateSet::load(dir.path());
        match result.err().unwrap() {
            Error::FileNotFound(path) => assert!(path.contains("turbine-scheduler.template")),
            _ => panic!("Expected `FileNotFound` error"),
        }
    }

    #[test]
    fn malformed_yaml_fails_the_whole_load() {
        let dir = tempdir().unwrap();
        write_minimal_set(dir.path());
        let path = dir.path().join(LogicalTemplate::Cluster.file_name());
        std::fs::write(&path, "{ not yaml").unwrap();

        let result = TemplateSet::load(dir.path());
        match result.err().unwrap() {
            Error::ParsingError { path, .. } => assert!(path.contains("turbine-cluster.template")),
            _ => panic!("Expected `ParsingError` error"),
        }
    }

    #[test]
    fn file_names_follow_the_turbine_convention() {
        assert_eq!("turbine-master.template", LogicalTemplate::Master.file_name());
        assert_eq!(
            "turbine-workerset.template",
            LogicalTemplate::Workerset.file_name()
        );
    }
}
