//! HTML pages shown to the browser, with per-processor overrides.
//!
//! A page is looked up as `saml2idp/<processor>/<file>` first and
//! `saml2idp/<file>` second. Built-in defaults cover the generic names;
//! a configured template directory may override any of them.

use std::path::Path;

use handlebars::Handlebars;
use serde::Serialize;

use crate::{
    config::TemplateConfig,
    error::{SamlError, SamlResult},
};

pub const BASE_TEMPLATE_DIR: &str = "saml2idp";

pub const LOGIN_PAGE: &str = "login.html";
pub const LOGGED_OUT_PAGE: &str = "logged_out.html";
pub const ERROR_PAGE: &str = "error.html";

const DEFAULTS: [(&str, &str); 3] = [
    (LOGIN_PAGE, include_str!("../templates/saml2idp/login.html")),
    (
        LOGGED_OUT_PAGE,
        include_str!("../templates/saml2idp/logged_out.html"),
    ),
    (ERROR_PAGE, include_str!("../templates/saml2idp/error.html")),
];

/// Candidate template names, most specific first.
pub fn template_names(filename: &str, processor: Option<&str>) -> Vec<String> {
    let generic = format!("{BASE_TEMPLATE_DIR}/{filename}");
    match processor {
        Some(name) => vec![format!("{BASE_TEMPLATE_DIR}/{name}/{filename}"), generic],
        None => vec![generic],
    }
}

#[derive(Clone)]
pub struct Templates {
    handlebars: Handlebars<'static>,
}

impl Templates {
    /// Built-in pages only.
    pub fn new() -> SamlResult<Self> {
        let mut handlebars = Handlebars::new();
        handlebars.set_strict_mode(true);
        for (filename, source) in DEFAULTS {
            handlebars.register_template_string(&template_names(filename, None)[0], source)?;
        }
        Ok(Templates { handlebars })
    }

    /// Built-in pages plus any overrides found under the configured directory.
    pub fn load<'a>(
        config: &TemplateConfig,
        processors: impl IntoIterator<Item = &'a str>,
    ) -> SamlResult<Self> {
        let mut templates = Self::new()?;
        let Some(directory) = &config.directory else {
            return Ok(templates);
        };

        let processors: Vec<&str> = processors.into_iter().collect();
        for (filename, _) in DEFAULTS {
            let candidates = std::iter::once(None)
                .chain(processors.iter().copied().map(Some))
                .map(|processor| template_names(filename, processor).remove(0));
            for name in candidates {
                templates.register_override(directory, &name)?;
            }
        }
        Ok(templates)
    }

    fn register_override(&mut self, directory: &Path, name: &str) -> SamlResult<()> {
        let path = directory.join(name);
        if !path.is_file() {
            return Ok(());
        }
        let source = std::fs::read_to_string(&path)
            .map_err(|e| SamlError::Template(format!("{}: {e}", path.display())))?;
        self.handlebars.register_template_string(name, source)?;
        tracing::debug!(template = %name, path = %path.display(), "registered template override");
        Ok(())
    }

    /// Render the most specific registered template for `filename`.
    pub fn render<T: Serialize>(
        &self,
        filename: &str,
        processor: Option<&str>,
        data: &T,
    ) -> SamlResult<String> {
        let name = template_names(filename, processor)
            .into_iter()
            .find(|name| self.handlebars.has_template(name))
            .ok_or_else(|| SamlError::Template(format!("no template for {filename}")))?;
        Ok(self.handlebars.render(&name, data)?)
    }
}
