//! 内置工具：沙箱文件操作、shell、文件搜索、工具帮助与语义搜索

pub mod filesystem;
pub mod help;
pub mod search;
pub mod semantic;
pub mod shell;

pub use filesystem::{CreateFileTool, EditFileTool, ListDirectoryTool, ReadFileTool, SafeFs};
pub use help::ToolHelpTool;
pub use search::{ContentMatch, ContentQuery, FileSearcher, SearchFilesByContentTool, SearchFilesByNameTool};
pub use semantic::SemanticSearchTool;
pub use shell::RunShellTool;

use std::sync::Arc;

use crate::config::AppConfig;
use crate::context::{ContextRetriever, Reindenter};
use crate::tools::ToolRegistry;

/// 把内置工具注册到 registry；semantic_search 只在有检索器时注册
pub fn register_builtin_tools(
    registry: &Arc<ToolRegistry>,
    config: &AppConfig,
    retriever: Option<Arc<dyn ContextRetriever>>,
    reindenter: Arc<dyn Reindenter>,
) {
    let workspace = config.tools.workspace();
    let fs = SafeFs::new(&workspace);
    let limit = config.tools.batch_max_results;

    registry.register(ReadFileTool::new(fs.clone()));
    registry.register(CreateFileTool::new(fs.clone()));
    registry.register(EditFileTool::new(fs.clone(), reindenter));
    registry.register(ListDirectoryTool::new(fs.clone()));
    registry.register(RunShellTool::new(
        &config.safety,
        fs.root().to_path_buf(),
        config.tools.tool_timeout_secs,
    ));
    registry.register(SearchFilesByNameTool::new(FileSearcher::new(fs.clone()), limit));
    registry.register(SearchFilesByContentTool::new(FileSearcher::new(fs), limit));
    registry.register(ToolHelpTool::new(Arc::downgrade(registry)));
    if let Some(retriever) = retriever {
        registry.register(SemanticSearchTool::new(retriever));
    }

    tracing::info!(
        workspace = %workspace.display(),
        tools = registry.list().len(),
        "built-in tools registered"
    );
}
