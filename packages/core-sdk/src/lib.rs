pub mod config;
pub mod db;
pub mod llm;
pub mod models;
pub mod server;
pub mod telemetry;
pub mod validation;

/**
 * \brief SDK 预导入集合，方便外部引用常用模块。
 */
pub mod prelude {
    pub use crate::config;
    pub use crate::db;
    pub use crate::llm;
    pub use crate::models;
    pub use crate::server;
    pub use crate::telemetry;
    pub use crate::validation;
}
