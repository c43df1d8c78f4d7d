use std::path::Path;

use git2::build::RepoBuilder;
use git2::{FetchOptions, Repository, SubmoduleUpdateOptions};

use crate::cache::Fetcher;
use crate::{blog_debug, Result};

/// Clones git repositories into cache slots.
#[derive(Debug, Clone, Default)]
pub struct GitFetcher {
    depth: Option<u32>,
}

impl GitFetcher {
    /// A fetcher making shallow clones of `depth` commits, or full clones
    /// when `depth` is `None`.
    pub fn new(depth: Option<u32>) -> Self {
        Self { depth }
    }

    pub fn depth(&self) -> Option<u32> {
        self.depth
    }

    /// libgit2's local transport cannot make shallow clones, so local paths
    /// are always cloned in full.
    fn fetch_options(&self, locator: &str) -> FetchOptions<'static> {
        let mut opts = FetchOptions::new();
        match self.depth {
            Some(depth) if !Path::new(locator).exists() => {
                opts.depth(depth as i32);
            }
            _ => {}
        }
        opts
    }
}

impl Fetcher for GitFetcher {
    fn fetch(&self, locator: &str, selector: Option<&str>, dest: &Path) -> Result<()> {
        blog_debug!(
            "GitFetcher::fetch locator={} branch={:?} depth={:?} dest={}",
            locator,
            selector,
            self.depth,
            dest.display()
        );
        let mut builder = RepoBuilder::new();
        builder.fetch_options(self.fetch_options(locator));
        if let Some(branch) = selector {
            builder.branch(branch);
        }
        let repo = builder.clone(locator, dest)?;
        if let Ok(head) = repo.head() {
            blog_debug!("cloned {} at {:?}", locator, head.target());
        }
        Ok(())
    }

    fn post_fetch(&self, dir: &Path) -> Result<()> {
        let repo = Repository::open(dir)?;
        update_submodules(&repo)
    }
}

/// `git submodule update --init --recursive`.
fn update_submodules(repo: &Repository) -> Result<()> {
    for mut submodule in repo.submodules()? {
        blog_debug!("updating submodule {}", submodule.path().display());
        let mut opts = SubmoduleUpdateOptions::new();
        submodule.update(true, Some(&mut opts))?;
        let nested = submodule.open()?;
        update_submodules(&nested)?;
    }
    Ok(())
}
