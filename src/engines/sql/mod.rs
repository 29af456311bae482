//! The SQL engine: Jinja-style templates rendered to final SQL.

pub use self::executor::{SqlOutput, execute_sql, is_select_like};
pub use self::safety::{SafetyWarning, check_template_safety};
pub use self::template::TemplateEngine;

mod executor;
mod filters;
mod safety;
mod template;
