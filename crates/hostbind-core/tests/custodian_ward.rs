use hostbind_core::{
    ArgFact, CallDescriptor, CallFacts, CallResolution, DecrefOutcome, DescriptorTable,
    FinalizeAction, InvariantViolation, LifetimeError, Manager, ManagerConfig, ProxyRef,
    RefcountMethods, SimHeap, TypeDescriptor, ValueDescriptor,
};

fn manager() -> Manager<SimHeap> {
    let table = DescriptorTable::from_parts(
        vec![
            TypeDescriptor::owned("Foo"),
            TypeDescriptor::owned("Container"),
            TypeDescriptor::borrowed("Item"),
            TypeDescriptor::ref_counted(
                "Zbr",
                RefcountMethods::new("Ref", "Unref", Some("GetReferenceCount")),
            ),
        ],
        vec![],
        vec![
            CallDescriptor::function("mod", "makeFoo()")
                .returns(ValueDescriptor::of("Foo").caller_owns()),
            CallDescriptor::constructor("Container", "Container()"),
            CallDescriptor::constructor("Zbr", "Zbr()"),
            CallDescriptor::method("Container", "adopt(Foo*)")
                .param(ValueDescriptor::of("Foo").custodian(0)),
            CallDescriptor::method("Container", "attach(Container*)")
                .param(ValueDescriptor::of("Container").custodian(0)),
            CallDescriptor::method("Container", "first_item()")
                .returns(ValueDescriptor::of("Item").internal_reference()),
            CallDescriptor::method("Foo", "hold(Container*)")
                .param(ValueDescriptor::of("Container").custodian(0)),
            CallDescriptor::function("mod", "wrap(Foo*)")
                .param(ValueDescriptor::of("Foo").custodian(-1))
                .returns(ValueDescriptor::of("Container").caller_owns()),
            CallDescriptor::method("Zbr", "child()")
                .returns(ValueDescriptor::of("Item").internal_reference()),
        ],
    )
    .unwrap();
    Manager::new(table, SimHeap::new(), ManagerConfig::default())
}

fn resolve(m: &Manager<SimHeap>, owner: &str, sig: &str, facts: CallFacts) -> hostbind_core::Result<CallResolution> {
    let desc = m.call(owner, sig).unwrap().clone();
    m.resolve_call(&desc, &facts)
}

fn make(m: &Manager<SimHeap>, type_name: &str, owner: &str, sig: &str) -> ProxyRef {
    let h = m.native().alloc(type_name);
    resolve(m, owner, sig, CallFacts::new().returns(ArgFact::Handle(h)))
        .unwrap()
        .ret()
        .unwrap()
}

#[test]
fn custodian_finalization_never_destroys_the_ward() {
    let m = manager();
    let c = make(&m, "Container", "Container", "Container()");
    let f = make(&m, "Foo", "mod", "makeFoo()");
    let res = resolve(&m, "Container", "adopt(Foo*)", CallFacts::new().receiver(c).arg(ArgFact::Proxy(f))).unwrap();
    assert_eq!(res.edges, vec![(f, c)]);
    assert_eq!(m.proxy_info(c).unwrap().wards, vec![f]);

    let foo_handle = m.proxy_info(f).unwrap().handle;
    let fin = m.finalize_proxy(c).unwrap();
    assert_eq!(fin.released_wards, vec![f]);
    assert!(m.native().is_alive(foo_handle));
    assert!(m.is_releasable(f).unwrap());

    let fin = m.finalize_proxy(f).unwrap();
    assert!(matches!(fin.action, FinalizeAction::Destroyed { .. }));
    assert_eq!(m.native().destroy_count(foo_handle), 1);
}

#[test]
fn ward_collected_before_its_custodian_still_runs_its_disposition() {
    let m = manager();
    let c = make(&m, "Container", "Container", "Container()");
    let f = make(&m, "Foo", "mod", "makeFoo()");
    resolve(&m, "Container", "adopt(Foo*)", CallFacts::new().receiver(c).arg(ArgFact::Proxy(f))).unwrap();
    let foo_handle = m.proxy_info(f).unwrap().handle;

    let fin = m.finalize_proxy(f).unwrap();
    assert!(matches!(fin.action, FinalizeAction::Destroyed { .. }));
    assert_eq!(m.native().destroy_count(foo_handle), 1);
    assert!(m.proxy_info(c).unwrap().wards.is_empty());

    let fin = m.finalize_proxy(c).unwrap();
    assert!(fin.released_wards.is_empty());
    assert_eq!(m.native().destroy_count(foo_handle), 1);
    assert_eq!(m.live_proxies(), 0);
}

#[test]
fn repeated_edges_are_recorded_once() {
    let m = manager();
    let c = make(&m, "Container", "Container", "Container()");
    let f = make(&m, "Foo", "mod", "makeFoo()");
    for _ in 0..2 {
        resolve(&m, "Container", "adopt(Foo*)", CallFacts::new().receiver(c).arg(ArgFact::Proxy(f))).unwrap();
    }
    assert_eq!(m.proxy_info(f).unwrap().custodians, vec![c]);
    assert_eq!(m.proxy_info(c).unwrap().wards, vec![f]);
}

#[test]
fn internal_reference_defaults_to_the_receiver() {
    let m = manager();
    let c = make(&m, "Container", "Container", "Container()");
    let ih = m.native().alloc("Item");
    let res = resolve(
        &m,
        "Container",
        "first_item()",
        CallFacts::new().receiver(c).returns(ArgFact::Handle(ih)),
    )
    .unwrap();
    let item = res.ret().unwrap();
    assert_eq!(res.edges, vec![(item, c)]);
    assert!(!m.is_releasable(item).unwrap());
}

#[test]
fn return_value_can_be_the_custodian() {
    let m = manager();
    let f = make(&m, "Foo", "mod", "makeFoo()");
    let wh = m.native().alloc("Container");
    let res = resolve(
        &m,
        "mod",
        "wrap(Foo*)",
        CallFacts::new().arg(ArgFact::Proxy(f)).returns(ArgFact::Handle(wh)),
    )
    .unwrap();
    let wrapper = res.ret().unwrap();
    assert_eq!(res.edges, vec![(f, wrapper)]);
    assert_eq!(m.proxy_info(f).unwrap().custodians, vec![wrapper]);
}

#[test]
fn cycles_are_rejected_before_anything_changes() {
    let m = manager();
    let c = make(&m, "Container", "Container", "Container()");
    let f = make(&m, "Foo", "mod", "makeFoo()");
    resolve(&m, "Container", "adopt(Foo*)", CallFacts::new().receiver(c).arg(ArgFact::Proxy(f))).unwrap();

    let err = resolve(&m, "Foo", "hold(Container*)", CallFacts::new().receiver(f).arg(ArgFact::Proxy(c)))
        .unwrap_err();
    assert!(matches!(
        err,
        LifetimeError::Invariant(InvariantViolation::CustodianCycle { .. })
    ));
    assert!(m.proxy_info(c).unwrap().custodians.is_empty());

    let err = resolve(&m, "Container", "attach(Container*)", CallFacts::new().receiver(c).arg(ArgFact::Proxy(c)))
        .unwrap_err();
    assert!(matches!(
        err,
        LifetimeError::Invariant(InvariantViolation::CustodianCycle { .. })
    ));
}

#[test]
fn refcounted_custodian_releases_wards_when_destroyed() {
    let m = manager();
    let z = make(&m, "Zbr", "Zbr", "Zbr()");
    let ih = m.native().alloc("Item");
    let item = resolve(&m, "Zbr", "child()", CallFacts::new().receiver(z).returns(ArgFact::Handle(ih)))
        .unwrap()
        .ret()
        .unwrap();

    assert_eq!(
        m.decref(z).unwrap(),
        DecrefOutcome::Destroyed { released_wards: vec![item] }
    );
    assert!(m.is_releasable(item).unwrap());
    assert!(m.native().is_alive(ih));
}

#[test]
fn shutdown_drops_proxies_without_native_calls() {
    let m = manager();
    let c = make(&m, "Container", "Container", "Container()");
    let f = make(&m, "Foo", "mod", "makeFoo()");
    resolve(&m, "Container", "adopt(Foo*)", CallFacts::new().receiver(c).arg(ArgFact::Proxy(f))).unwrap();

    assert_eq!(m.shutdown(), 2);
    assert_eq!(m.live_proxies(), 0);
    assert!(m.native().destroyed().is_empty());
    assert!(!m.is_live(c));
}
