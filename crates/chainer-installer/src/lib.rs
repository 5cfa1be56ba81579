//! Package-kind engines: executables, native installer databases and OS
//! updates, plus the payload cache and product receipts they rely on.

use std::rc::Rc;

use chainer_plan::PackageEngines;

mod cache;
mod exe;
mod native;
mod receipts;
mod runner;

pub use cache::{CacheOutcome, PayloadCache};
pub use exe::ExeEngine;
pub use native::{
    MsiEngine, MsuEngine, NativeTools, EXIT_SUCCESS_REBOOT_INITIATED,
    EXIT_SUCCESS_REBOOT_REQUIRED,
};
pub use receipts::{ProductReceipt, ProductStore, ReceiptStore};
pub use runner::{split_arguments, ProcessRunner, SystemProcessRunner};

/// Shared seams every package engine is built from.
#[derive(Clone)]
pub struct InstallerContext {
    pub cache: PayloadCache,
    pub runner: Rc<dyn ProcessRunner>,
    pub products: Rc<dyn ProductStore>,
    pub tools: NativeTools,
}

impl InstallerContext {
    /// Real processes and receipts stored beside the cache.
    pub fn system(cache: PayloadCache) -> Self {
        let products = ReceiptStore::new(cache.layout().clone());
        Self {
            cache,
            runner: Rc::new(SystemProcessRunner),
            products: Rc::new(products),
            tools: NativeTools::default(),
        }
    }
}

/// One engine per supported package kind.
pub fn default_engines(context: &InstallerContext) -> PackageEngines {
    PackageEngines::new()
        .with(Box::new(ExeEngine::new(
            context.cache.clone(),
            Rc::clone(&context.runner),
            Rc::clone(&context.products),
        )))
        .with(Box::new(MsiEngine::new(
            context.cache.clone(),
            Rc::clone(&context.runner),
            Rc::clone(&context.products),
            &context.tools,
        )))
        .with(Box::new(MsuEngine::new(
            context.cache.clone(),
            Rc::clone(&context.runner),
            Rc::clone(&context.products),
            &context.tools,
        )))
}

#[cfg(test)]
mod tests;
