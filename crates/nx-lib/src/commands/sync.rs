//! `nx sync`: root tsconfig project-reference sync through the virtual
//! tree.

use nxpath::AbsoluteSystemPath;

use crate::{
    run::{load_workspace, RunError},
    sync::sync_root_tsconfig_references,
    tree::FsTree,
};

pub async fn sync_command(repo_root: &AbsoluteSystemPath) -> Result<i32, RunError> {
    let workspace = load_workspace(repo_root)?;
    let mut tree = FsTree::new(repo_root);
    let changed = sync_root_tsconfig_references(&mut tree, &workspace.graph)
        .map_err(RunError::Sync)?;
    if changed {
        tree.commit().map_err(|err| RunError::Sync(err.into()))?;
        println!("updated root tsconfig.json project references");
    } else {
        println!("root tsconfig.json project references are in sync");
    }
    Ok(0)
}
