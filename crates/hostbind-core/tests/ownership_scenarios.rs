use hostbind_core::sim::SimHeap;
use hostbind_core::{
    ArgFact, CallDescriptor, CallFacts, DescriptorTable, Direction, Disposition, ErrorDescriptor,
    FinalizeAction, InvariantViolation, LifetimeError, Manager, ManagerConfig, NativeHandle,
    NativeSignal, Position, RefcountMethods, TransferPolicy, TypeDescriptor, ValueDescriptor,
};

fn table() -> DescriptorTable {
    DescriptorTable::from_parts(
        vec![
            TypeDescriptor::owned("Foo"),
            TypeDescriptor::owned("Container"),
            TypeDescriptor::borrowed("Item"),
            TypeDescriptor::ref_counted(
                "Zbr",
                RefcountMethods::new("Ref", "Unref", Some("GetReferenceCount")),
            ),
            TypeDescriptor::borrowed("Registry").singleton(),
        ],
        vec![
            ErrorDescriptor::new("std::exception", "RuntimeError"),
            ErrorDescriptor::new("std::domain_error", "DomainError").with_parent("std::exception"),
        ],
        vec![
            CallDescriptor::function("mod", "makeFoo()")
                .returns(ValueDescriptor::of("Foo").caller_owns()),
            CallDescriptor::function("mod", "consumeFoo(Foo*)")
                .param(ValueDescriptor::of("Foo").transfer()),
            CallDescriptor::function("mod", "getInternal(Container*)")
                .param(ValueDescriptor::of("Container"))
                .returns(ValueDescriptor::of("Item").reference_existing().custodian(1)),
            CallDescriptor::function("mod", "twins(Item**)")
                .param(ValueDescriptor::of("Item").direction(Direction::Out))
                .returns(ValueDescriptor::of("Item")),
            CallDescriptor::function("mod", "instance()").returns(ValueDescriptor::of("Registry")),
            CallDescriptor::function("mod", "fooAndInstance(Foo**)")
                .param(ValueDescriptor::of("Foo").direction(Direction::Out).caller_owns())
                .returns(ValueDescriptor::of("Registry")),
            CallDescriptor::function("mod", "fooAndZbr(Foo**)")
                .param(ValueDescriptor::of("Foo").direction(Direction::Out).caller_owns())
                .returns(ValueDescriptor::of("Zbr")),
            CallDescriptor::constructor("Container", "Container()"),
            CallDescriptor::constructor("Zbr", "Zbr()"),
            CallDescriptor::method("Container", "get_zbr()").returns(ValueDescriptor::of("Zbr")),
            CallDescriptor::method("Container", "set_divisor(int)")
                .param(ValueDescriptor::plain())
                .throws("std::domain_error"),
        ],
    )
    .unwrap()
}

fn manager(config: ManagerConfig) -> Manager<SimHeap> {
    Manager::new(table(), SimHeap::new(), config)
}

fn call(m: &Manager<SimHeap>, owner: &str, sig: &str, facts: CallFacts) -> hostbind_core::Result<hostbind_core::CallResolution> {
    let desc = m.call(owner, sig).unwrap().clone();
    m.resolve_call(&desc, &facts)
}

fn violation(err: LifetimeError) -> InvariantViolation {
    match err {
        LifetimeError::Invariant(v) => v,
        other => panic!("expected an invariant violation, got {other:?}"),
    }
}

#[test]
fn caller_owned_return_is_destroyed_exactly_once() {
    let m = manager(ManagerConfig::default());
    let h = m.native().alloc_at("Foo", NativeHandle(0xa1));

    let res = call(&m, "mod", "makeFoo()", CallFacts::new().returns(ArgFact::Handle(h))).unwrap();
    assert_eq!(res.disposition(Position::Return), Some(Disposition::CreateOwnedProxy));
    let foo = res.ret().unwrap();
    assert_eq!(m.lookup("Foo", h), Some(foo));

    let fin = m.finalize_proxy(foo).unwrap();
    assert_eq!(fin.action, FinalizeAction::Destroyed { via: "delete".to_string() });
    assert_eq!(m.native().destroy_count(h), 1);

    let err = violation(m.finalize_proxy(foo).unwrap_err());
    assert_eq!(err, InvariantViolation::StaleProxy(foo));
    assert_eq!(m.native().destroy_count(h), 1);
}

#[test]
fn internal_reference_pins_ward_to_custodian() {
    let m = manager(ManagerConfig::default());
    let ch = m.native().alloc("Container");
    let c1 = call(&m, "Container", "Container()", CallFacts::new().returns(ArgFact::Handle(ch)))
        .unwrap()
        .ret()
        .unwrap();

    let item = NativeHandle(0xb2);
    let res = call(
        &m,
        "mod",
        "getInternal(Container*)",
        CallFacts::new().arg(ArgFact::Proxy(c1)).returns(ArgFact::Handle(item)),
    )
    .unwrap();
    assert_eq!(
        res.dispositions(),
        vec![Disposition::BorrowExistingProxy, Disposition::CreateBorrowedProxy]
    );
    let w1 = res.ret().unwrap();
    assert_eq!(res.edges, vec![(w1, c1)]);
    assert!(!m.is_releasable(w1).unwrap());

    let fin = m.finalize_proxy(c1).unwrap();
    assert_eq!(fin.released_wards, vec![w1]);
    assert!(m.is_live(w1));
    assert!(m.is_releasable(w1).unwrap());
    assert_eq!(m.native().destroy_count(item), 0);

    assert_eq!(m.finalize_proxy(w1).unwrap().action, FinalizeAction::Detached);
    assert_eq!(m.live_proxies(), 0);
}

#[test]
fn refcounted_handle_maps_to_one_proxy() {
    let m = manager(ManagerConfig::default());
    let zh = m.native().alloc("Zbr");
    let res = call(&m, "Zbr", "Zbr()", CallFacts::new().returns(ArgFact::Handle(zh))).unwrap();
    assert_eq!(
        res.disposition(Position::Return),
        Some(Disposition::CreateRefcountedProxy { incref: false })
    );
    let z = res.ret().unwrap();
    assert_eq!(m.peek(z).unwrap(), Some(1));
    assert!(m.is_solely_held(z).unwrap());

    let ch = m.native().alloc("Container");
    let c = call(&m, "Container", "Container()", CallFacts::new().returns(ArgFact::Handle(ch)))
        .unwrap()
        .ret()
        .unwrap();
    let again = call(
        &m,
        "Container",
        "get_zbr()",
        CallFacts::new().receiver(c).returns(ArgFact::Handle(zh)),
    )
    .unwrap();
    assert_eq!(again.disposition(Position::Return), Some(Disposition::BorrowExistingProxy));
    assert_eq!(again.ret(), Some(z));
    assert_eq!(m.native().refcount(zh), Some(2));
    assert!(!m.is_solely_held(z).unwrap());

    m.decref(z).unwrap();
    assert_eq!(m.peek(z).unwrap(), Some(1));
    assert_eq!(m.native().refcount(zh), Some(1));
    assert!(m.is_live(z));
}

#[test]
fn second_transfer_is_rejected() {
    let m = manager(ManagerConfig::default());
    let h = m.native().alloc_at("Foo", NativeHandle(0xa1));
    let foo = call(&m, "mod", "makeFoo()", CallFacts::new().returns(ArgFact::Handle(h)))
        .unwrap()
        .ret()
        .unwrap();

    let res = call(&m, "mod", "consumeFoo(Foo*)", CallFacts::new().arg(ArgFact::Proxy(foo))).unwrap();
    assert_eq!(res.disposition(Position::Param(1)), Some(Disposition::TransferToNative));
    assert!(!m.is_live(foo));

    let err = call(&m, "mod", "consumeFoo(Foo*)", CallFacts::new().arg(ArgFact::Proxy(foo)))
        .unwrap_err();
    assert!(matches!(violation(err), InvariantViolation::DoubleTransfer { handle, .. } if handle == h));

    let err = call(&m, "mod", "consumeFoo(Foo*)", CallFacts::new().arg(ArgFact::Handle(h)))
        .unwrap_err();
    assert!(matches!(violation(err), InvariantViolation::DoubleTransfer { .. }));
    assert_eq!(m.native().destroy_count(h), 0);
    assert_eq!(m.snapshot().transferred.len(), 1);
}

#[test]
fn reacquired_handle_can_be_transferred_again() {
    let m = manager(ManagerConfig::default());
    let h = m.native().alloc_at("Foo", NativeHandle(0xa1));
    let make = |m: &Manager<SimHeap>| {
        call(m, "mod", "makeFoo()", CallFacts::new().returns(ArgFact::Handle(h)))
            .unwrap()
            .ret()
            .unwrap()
    };

    let first = make(&m);
    call(&m, "mod", "consumeFoo(Foo*)", CallFacts::new().arg(ArgFact::Proxy(first))).unwrap();
    let second = make(&m);
    assert_ne!(first, second);
    assert!(m.snapshot().transferred.is_empty());
    call(&m, "mod", "consumeFoo(Foo*)", CallFacts::new().arg(ArgFact::Proxy(second))).unwrap();
}

#[test]
fn downgrade_policy_keeps_proxy_as_borrowed() {
    let m = manager(ManagerConfig {
        transfer_policy: TransferPolicy::Downgrade,
        ..ManagerConfig::default()
    });
    let h = m.native().alloc_at("Foo", NativeHandle(0xa1));
    let foo = call(&m, "mod", "makeFoo()", CallFacts::new().returns(ArgFact::Handle(h)))
        .unwrap()
        .ret()
        .unwrap();

    let res = call(&m, "mod", "consumeFoo(Foo*)", CallFacts::new().arg(ArgFact::Proxy(foo))).unwrap();
    assert_eq!(res.proxy(Position::Param(1)), Some(foo));
    assert_eq!(m.proxy_info(foo).unwrap().mode.as_str(), "borrowed");

    let err = call(&m, "mod", "consumeFoo(Foo*)", CallFacts::new().arg(ArgFact::Proxy(foo)))
        .unwrap_err();
    assert!(matches!(violation(err), InvariantViolation::DoubleTransfer { .. }));

    assert_eq!(m.finalize_proxy(foo).unwrap().action, FinalizeAction::Detached);
    assert_eq!(m.native().destroy_count(h), 0);
}

#[test]
fn declared_native_error_becomes_domain_error() {
    let m = manager(ManagerConfig::default());
    let desc = m.call("Container", "set_divisor(int)").unwrap().clone();
    let err = m
        .bridge_error(&desc, &NativeSignal::new("std::domain_error", "value must be != 0"))
        .unwrap();
    assert_eq!(err.kind, "DomainError");
    assert_eq!(err.message, "value must be != 0");

    let err = m
        .bridge_error(&desc, &NativeSignal::new("std::bad_alloc", "oom"))
        .unwrap_err();
    assert_eq!(err.kind(), "unmapped_native_failure");
}

#[test]
fn singleton_keeps_one_proxy() {
    let m = manager(ManagerConfig::default());
    let first = call(&m, "mod", "instance()", CallFacts::new().returns(ArgFact::Handle(NativeHandle(0x500))))
        .unwrap();
    assert_eq!(first.disposition(Position::Return), Some(Disposition::CreateBorrowedProxy));
    let reg = first.ret().unwrap();

    let again = call(&m, "mod", "instance()", CallFacts::new().returns(ArgFact::Handle(NativeHandle(0x500))))
        .unwrap();
    assert_eq!(again.ret(), Some(reg));

    let err = call(&m, "mod", "instance()", CallFacts::new().returns(ArgFact::Handle(NativeHandle(0x600))))
        .unwrap_err();
    assert!(matches!(
        violation(err),
        InvariantViolation::SingletonConflict { existing, requested, .. }
            if existing == NativeHandle(0x500) && requested == NativeHandle(0x600)
    ));

    assert_eq!(m.finalize_proxy(reg).unwrap().action, FinalizeAction::Detached);
}

#[test]
fn failed_call_leaves_registry_untouched() {
    let m = manager(ManagerConfig::default());
    call(&m, "mod", "instance()", CallFacts::new().returns(ArgFact::Handle(NativeHandle(0x500))))
        .unwrap();
    let before = m.snapshot();

    let err = call(
        &m,
        "mod",
        "fooAndInstance(Foo**)",
        CallFacts::new()
            .arg(ArgFact::Handle(NativeHandle(0x700)))
            .returns(ArgFact::Handle(NativeHandle(0x600))),
    )
    .unwrap_err();
    assert_eq!(err.kind(), "invariant_violation");
    assert_eq!(m.snapshot(), before);
    assert_eq!(m.lookup("Foo", NativeHandle(0x700)), None);
}

#[test]
fn second_owner_for_a_handle_is_rejected() {
    let m = manager(ManagerConfig::default());
    let h = m.native().alloc_at("Foo", NativeHandle(0xa1));
    let foo = call(&m, "mod", "makeFoo()", CallFacts::new().returns(ArgFact::Handle(h)))
        .unwrap()
        .ret()
        .unwrap();
    let err = call(&m, "mod", "makeFoo()", CallFacts::new().returns(ArgFact::Handle(h))).unwrap_err();
    assert!(matches!(violation(err), InvariantViolation::DoubleOwnership { proxy, .. } if proxy == foo));
}

#[test]
fn repeated_handle_in_one_call_shares_a_proxy() {
    let m = manager(ManagerConfig::default());
    let h = NativeHandle(0x800);
    let res = call(
        &m,
        "mod",
        "twins(Item**)",
        CallFacts::new().arg(ArgFact::Handle(h)).returns(ArgFact::Handle(h)),
    )
    .unwrap();
    assert_eq!(
        res.dispositions(),
        vec![Disposition::CreateBorrowedProxy, Disposition::BorrowExistingProxy]
    );
    assert_eq!(res.proxy(Position::Param(1)), res.ret());
    assert_eq!(m.live_proxies(), 1);
}

#[test]
fn null_and_mismatched_facts() {
    let m = manager(ManagerConfig::default());
    let res = call(&m, "mod", "makeFoo()", CallFacts::new().returns(ArgFact::Null)).unwrap();
    assert_eq!(res.dispositions(), vec![Disposition::NoWrap]);
    assert_eq!(m.live_proxies(), 0);

    let err = call(&m, "mod", "makeFoo()", CallFacts::new().arg(ArgFact::Plain)).unwrap_err();
    assert!(matches!(violation(err), InvariantViolation::FactMismatch { .. }));

    let err = call(&m, "Container", "get_zbr()", CallFacts::new()).unwrap_err();
    assert!(matches!(violation(err), InvariantViolation::FactMismatch { .. }));

    let err = m.call("mod", "missing()").unwrap_err();
    assert!(matches!(violation(err), InvariantViolation::FactMismatch { .. }));
}

#[test]
fn native_failure_mid_call_leaves_no_proxy_behind() {
    let m = manager(ManagerConfig::default());
    let fh = m.native().alloc("Foo");
    let zh = m.native().alloc("Zbr");
    let facts = CallFacts::new()
        .arg(ArgFact::Handle(fh))
        .returns(ArgFact::Handle(zh));

    m.native().fail_method("Ref", NativeSignal::new("std::bad_alloc", "oom"));
    match call(&m, "mod", "fooAndZbr(Foo**)", facts.clone()).unwrap_err() {
        LifetimeError::UnmappedNativeFailure { call: failed, .. } => assert_eq!(failed, "Zbr::Ref"),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(m.live_proxies(), 0);
    assert_eq!(m.lookup("Foo", fh), None);
    assert_eq!(m.native().refcount(zh), Some(1));

    m.native().clear_failure("Ref");
    let res = call(&m, "mod", "fooAndZbr(Foo**)", facts).unwrap();
    assert_eq!(
        res.dispositions(),
        vec![
            Disposition::CreateOwnedProxy,
            Disposition::CreateRefcountedProxy { incref: true },
        ]
    );
    assert_eq!(m.native().refcount(zh), Some(2));
    assert_eq!(m.live_proxies(), 2);
}

#[test]
fn failed_count_read_returns_the_reference_taken() {
    let m = manager(ManagerConfig::default());
    let ch = m.native().alloc("Container");
    let c1 = call(&m, "Container", "Container()", CallFacts::new().returns(ArgFact::Handle(ch)))
        .unwrap()
        .ret()
        .unwrap();
    let zh = m.native().alloc("Zbr");
    let z = call(&m, "Zbr", "Zbr()", CallFacts::new().returns(ArgFact::Handle(zh)))
        .unwrap()
        .ret()
        .unwrap();

    m.native()
        .fail_method("GetReferenceCount", NativeSignal::new("std::runtime_error", "busy"));
    let err = call(
        &m,
        "Container",
        "get_zbr()",
        CallFacts::new().receiver(c1).returns(ArgFact::Handle(zh)),
    )
    .unwrap_err();
    assert!(matches!(err, LifetimeError::UnmappedNativeFailure { .. }));
    assert_eq!(m.native().refcount(zh), Some(1));
    let info = m.proxy_info(z).unwrap();
    assert_eq!((info.refcount, info.holds), (Some(1), 1));
}

#[test]
fn undeclared_call_is_never_bridged() {
    let m = manager(ManagerConfig::default());
    let stray = CallDescriptor::method("Container", "mystery()").throws("std::domain_error");
    let signal = NativeSignal::new("std::domain_error", "value must be != 0");
    let err = violation(m.bridge_error(&stray, &signal).unwrap_err());
    assert!(matches!(err, InvariantViolation::FactMismatch { .. }));

    let declared = m.call("Container", "set_divisor(int)").unwrap().clone();
    let host = m.bridge_error(&declared, &signal).unwrap();
    assert_eq!(host.kind, "DomainError");
}
