//! End-to-end tests for dynload.
//!
//! These exercise the loader through its public API: definition and
//! eviction, context isolation, chain walks, delegation, constants, close,
//! and concurrent first-use resolution.

use std::sync::{Arc, Barrier};

use dynload::chain::ResolutionScope;
use dynload::config::LoaderConfig;
use dynload::context::{Constant, Context, GenerationId};
use dynload::host::MemoryHost;
use dynload::loader::{DynamicLoader, Parent};
use dynload::unit::{Definition, SourceMeta};
use dynload::LoadError;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn app_loader(host: &Arc<MemoryHost>) -> Arc<DynamicLoader> {
    let root = DynamicLoader::root(host.clone());
    DynamicLoader::isolated(&root)
}

#[test]
fn define_then_find_returns_same_handle() {
    init_tracing();
    let host = Arc::new(MemoryHost::new());
    let loader = app_loader(&host);

    for i in 0..16u8 {
        let name = format!("app.core$fn__{i}");
        let unit = loader
            .define_unit(&name, vec![i, i.wrapping_add(1)], Some(SourceMeta::at("core.clj", i as u32 + 1, 1)))
            .unwrap();
        let found = loader.find_resident(&name).unwrap();
        assert!(Arc::ptr_eq(&unit, &found));
        // Keep it alive until the comparison is done, then let it go.
        drop(unit);
    }
}

#[test]
fn dropped_units_are_purged_by_next_call() {
    init_tracing();
    let host = Arc::new(MemoryHost::new());
    let loader = app_loader(&host);

    let a = loader.define_unit("app.A", vec![1u8], None).unwrap();
    let b = loader.define_unit("app.B", vec![2u8], None).unwrap();
    assert_eq!(loader.stats().resident, 2);

    drop(a);
    assert_eq!(loader.stats().pending_reclamations, 1);

    // A lookup for an unrelated name still drains the queue.
    assert!(loader.find_resident("app.B").is_some());
    assert_eq!(loader.stats().resident, 1);
    assert_eq!(loader.stats().pending_reclamations, 0);
    assert_eq!(loader.resident_names(), vec!["app.B".to_string()]);
    drop(b);
}

#[test]
fn siblings_never_see_each_other() {
    init_tracing();
    let host = Arc::new(MemoryHost::new());
    let root = DynamicLoader::root(host.clone());
    let a = DynamicLoader::isolated(&root);
    let b = DynamicLoader::isolated(&root);

    let unit_b = b.define_unit("sib.OnlyB", vec![1u8], None).unwrap();

    assert!(a.find_resident("sib.OnlyB").is_none());
    let scope_a = ResolutionScope::with_active(Arc::clone(a.context()));
    assert!(a.resolve_via_chain(&scope_a, "sib.OnlyB").is_none());
    assert!(a.resolve("sib.OnlyB", &scope_a).unwrap_err().is_not_found());

    // A context nested under B does see it: B is an ancestor.
    let nested = DynamicLoader::isolated(&b);
    let scope_nested = ResolutionScope::with_active(Arc::clone(nested.context()));
    let found = nested.resolve_via_chain(&scope_nested, "sib.OnlyB").unwrap();
    assert!(Arc::ptr_eq(&unit_b, &found));
}

#[test]
fn constants_are_keyed_by_generation() {
    let host = Arc::new(MemoryHost::new());
    let loader = app_loader(&host);
    let gens = dynload::context::GenerationAllocator::new();
    let g1 = gens.next_id().unwrap();
    let g2 = gens.next_id().unwrap();

    loader
        .register_constants(g1, vec![Constant::Keyword("x".into())])
        .unwrap();
    loader
        .register_constants(g2, vec![Constant::Keyword("y".into())])
        .unwrap();

    assert_eq!(
        &*loader.get_constants(g1).unwrap(),
        &[Constant::Keyword("x".into())]
    );
    assert_eq!(
        &*loader.get_constants(g2).unwrap(),
        &[Constant::Keyword("y".into())]
    );
    assert!(loader.get_constants(GenerationId::new(3)).is_none());
}

#[test]
fn redefined_name_keeps_old_generation_constants() {
    let host = Arc::new(MemoryHost::new());
    let loader = app_loader(&host);

    let old = loader.define_unit("app.F", vec![1u8], None).unwrap();
    loader
        .register_constants(GenerationId::new(10), vec![Constant::Int(1)])
        .unwrap();
    let pool_for_old = loader.get_constants(GenerationId::new(10)).unwrap();
    drop(old);

    let _new = loader.define_unit("app.F", vec![2u8], None).unwrap();
    loader
        .register_constants(GenerationId::new(11), vec![Constant::Int(2)])
        .unwrap();

    assert_eq!(&*pool_for_old, &[Constant::Int(1)]);
    assert_eq!(
        &*loader.get_constants(GenerationId::new(10)).unwrap(),
        &[Constant::Int(1)]
    );
}

#[test]
fn close_empties_cache_and_constants() {
    init_tracing();
    let host = Arc::new(MemoryHost::new());
    let loader = app_loader(&host);
    let names: Vec<String> = (0..8).map(|i| format!("closing.U{i}")).collect();
    let units: Vec<_> = names
        .iter()
        .map(|n| loader.define_unit(n, vec![7u8], None).unwrap())
        .collect();
    for i in 0..8u32 {
        loader
            .register_constants(GenerationId::new(i), vec![Constant::Int(i as i64)])
            .unwrap();
    }

    loader.close();

    for n in &names {
        assert!(loader.find_resident(n).is_none());
    }
    for i in 0..8u32 {
        assert!(loader.get_constants(GenerationId::new(i)).is_none());
    }
    assert!(matches!(
        loader.define_unit("closing.Late", vec![1u8], None),
        Err(LoadError::Closed { .. })
    ));
    // Code that already holds units keeps running.
    assert!(units.iter().all(|u| u.bytes() == [7]));
}

#[test]
fn concurrent_resolution_installs_once() {
    init_tracing();
    let host = Arc::new(MemoryHost::new());
    host.publish("mem://shared", Definition::new("lib.Shared", vec![3u8, 1, 4]));
    let loader = app_loader(&host);
    loader.add_search_location("mem://shared");

    let threads = 16;
    let barrier = Arc::new(Barrier::new(threads));
    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let loader = Arc::clone(&loader);
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                barrier.wait();
                loader
                    .resolve("lib.Shared", &ResolutionScope::new())
                    .unwrap()
            })
        })
        .collect();
    let units: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let first = &units[0];
    assert!(units.iter().all(|u| Arc::ptr_eq(u, first)));
    assert_eq!(host.install_count(), 1);
}

#[test]
fn concurrent_resolution_of_unknown_name_all_fail() {
    let host = Arc::new(MemoryHost::new());
    let loader = app_loader(&host);

    let threads = 8;
    let barrier = Arc::new(Barrier::new(threads));
    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let loader = Arc::clone(&loader);
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                barrier.wait();
                loader.resolve("lib.Nowhere", &ResolutionScope::new())
            })
        })
        .collect();
    for h in handles {
        let result = h.join().unwrap();
        assert!(matches!(result, Err(LoadError::NotFound { .. })));
    }
    assert_eq!(host.install_count(), 0);
}

#[test]
fn concurrent_definitions_of_one_name_leave_one_live_unit() {
    let host = Arc::new(MemoryHost::new());
    let loader = app_loader(&host);

    let threads = 8u8;
    let barrier = Arc::new(Barrier::new(threads as usize));
    let handles: Vec<_> = (0..threads)
        .map(|i| {
            let loader = Arc::clone(&loader);
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                barrier.wait();
                loader.define_unit("race.Unit", vec![i], None)
            })
        })
        .collect();
    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let winners: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    assert_eq!(winners.len(), 1);
    assert!(results
        .iter()
        .filter_map(|r| r.as_ref().err())
        .all(|e| matches!(e, LoadError::DuplicateDefinition { .. })));
    assert!(Arc::ptr_eq(winners[0], &loader.find_resident("race.Unit").unwrap()));
    assert_eq!(host.install_count(), 1);
}

#[test]
fn sandboxed_redefinition_scenario() {
    init_tracing();
    let host = Arc::new(MemoryHost::new());
    let root = DynamicLoader::root(host.clone());
    let c = DynamicLoader::isolated(&root);

    // C defines mod.A from B1.
    let u1 = c.define_unit("mod.A", vec![0xB1u8], None).unwrap();
    assert!(Arc::ptr_eq(&u1, &c.find_resident("mod.A").unwrap()));

    // A thread pushes a scoped override and looks there: absent.
    let sandbox = DynamicLoader::isolated(&root);
    let mut scope = ResolutionScope::with_active(Arc::clone(c.context()));
    scope.with_override(Arc::clone(sandbox.context()), |scope| {
        assert!(sandbox.find_resident("mod.A").is_none());

        // Until the override defines it too.
        let sandboxed = sandbox.define_unit("mod.A", vec![0xB2u8], None).unwrap();
        assert!(Arc::ptr_eq(&sandboxed, &sandbox.find_resident("mod.A").unwrap()));
        let via_chain = sandbox.resolve_via_chain(scope, "mod.A").unwrap();
        assert!(Arc::ptr_eq(&sandboxed, &via_chain));
    });
    // Popped: the chain sees C's unit again.
    let via_chain = c.resolve_via_chain(&scope, "mod.A").unwrap();
    assert!(Arc::ptr_eq(&u1, &via_chain));
    drop(via_chain);

    // U1 becomes unreachable; its reclamation is queued.
    let u1_id = u1.id();
    drop(u1);
    assert_eq!(c.stats().pending_reclamations, 1);

    // The next definition sweeps the stale entry before installing U2.
    let u2 = c.define_unit("mod.A", vec![0xB2u8], None).unwrap();
    assert_ne!(u2.id(), u1_id);
    assert_eq!(c.stats().pending_reclamations, 0);
    assert_eq!(c.stats().resident, 1);
    assert!(Arc::ptr_eq(&u2, &c.find_resident("mod.A").unwrap()));
}

#[test]
fn delegation_chain_reaches_grandparent_locations() {
    let host = Arc::new(MemoryHost::new());
    host.publish("mem://base", Definition::new("base.Util", vec![1u8]));

    let root = DynamicLoader::root(host.clone());
    let base = DynamicLoader::isolated(&root);
    base.add_search_location("mem://base");
    let mid = DynamicLoader::isolated(&base);
    let leaf = DynamicLoader::isolated(&mid);

    let unit = leaf.resolve("base.Util", &ResolutionScope::new()).unwrap();
    assert_eq!(unit.context(), Some(base.context_id()));
    assert!(Arc::ptr_eq(&unit, &base.find_resident("base.Util").unwrap()));
    assert!(leaf.find_resident("base.Util").is_none());
}

#[test]
fn load_for_execution_is_idempotent() {
    let host = Arc::new(MemoryHost::new());
    host.publish("mem://exec", Definition::new("exec.Main", vec![1u8]));
    let loader = app_loader(&host);
    loader.add_search_location("mem://exec");
    let scope = ResolutionScope::new();

    let a = loader.load_for_execution("exec.Main", true, &scope).unwrap();
    let b = loader.load_for_execution("exec.Main", true, &scope).unwrap();
    assert!(Arc::ptr_eq(&a, &b));
    assert!(a.is_linked());
    assert_eq!(host.install_count(), 1);
    assert_eq!(host.link_count(), 1);
}

#[test]
fn loader_from_config_file() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("loader.toml");
    std::fs::write(
        &path,
        "search_locations = [\"mem://cfg\"]\ncache_capacity = 16\nisolate = true\n",
    )
    .unwrap();
    let config = LoaderConfig::load(&path).unwrap();
    assert!(config.isolate);

    let host = Arc::new(MemoryHost::new());
    host.publish("mem://cfg", Definition::new("cfg.Unit", vec![1u8]));
    let parent = app_loader(&host);
    let loader =
        DynamicLoader::from_config_file(&path, Some(Parent::Dynamic(parent.clone())), host.clone())
            .unwrap();

    assert_ne!(loader.context_id(), parent.context_id());
    assert_eq!(loader.search_locations()[0].as_str(), "mem://cfg");
    let unit = loader.resolve("cfg.Unit", &ResolutionScope::new()).unwrap();
    assert_eq!(unit.context(), Some(loader.context_id()));
    assert!(parent.find_resident("cfg.Unit").is_none());
}

#[test]
fn root_context_is_shared_by_root_loaders() {
    let host = Arc::new(MemoryHost::new());
    let a = DynamicLoader::root(host.clone());
    let b = DynamicLoader::root(host.clone());
    assert_eq!(a.context_id(), b.context_id());
    assert!(Arc::ptr_eq(a.context(), Context::root()));

    let unit = a.define_unit("rootonly.Unit", vec![1u8], None).unwrap();
    assert!(Arc::ptr_eq(&unit, &b.find_resident("rootonly.Unit").unwrap()));

    // An empty scope falls through to the root.
    let isolated = DynamicLoader::isolated(&a);
    let found = isolated
        .resolve_via_chain(&ResolutionScope::new(), "rootonly.Unit")
        .unwrap();
    assert!(Arc::ptr_eq(&unit, &found));
}
