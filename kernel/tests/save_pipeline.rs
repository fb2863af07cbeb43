use regent_kernel::model::{
    AffectedValues, ElementKind, PolicyCatalog, PolicyDefinition, PolicyElement, PolicyId,
    PolicyRegistryValue, PolicyScope, PolicySection,
};
use regent_kernel::save::{build_buffers, ChangeStatus, PolicyChangeRequest};
use regent_kernel::state::{evaluate, read_options, OptionValue, PolicyOptions, PolicyState};
use regent_kernel::store::{PolFile, RegistryData, RegistryStore};

const TELEMETRY_KEY: &str = r"Software\Policies\Microsoft\Windows\DataCollection";
const DESKTOP_KEY: &str = r"Software\Policies\Microsoft\Windows\Control Panel\Desktop";

fn telemetry() -> PolicyDefinition {
    let mut policy = PolicyDefinition::new(
        PolicyId::new("Microsoft.Policies.DataCollection", "AllowTelemetry"),
        PolicySection::Machine,
        TELEMETRY_KEY,
    );
    policy.elements = vec![PolicyElement {
        required: true,
        ..PolicyElement::new(
            "Level",
            "AllowTelemetry",
            ElementKind::Decimal {
                min: 0,
                max: 3,
                store_as_text: false,
            },
        )
    }];
    policy
}

fn screen_saver() -> PolicyDefinition {
    let mut policy = PolicyDefinition::new(
        PolicyId::new("Microsoft.Policies.ControlPanelDisplay", "ScreenSaverActive"),
        PolicySection::User,
        DESKTOP_KEY,
    );
    policy.registry_value = Some("ScreenSaveActive".into());
    policy.affected_values = AffectedValues {
        on_value: Some(PolicyRegistryValue::Text("1".into())),
        off_value: Some(PolicyRegistryValue::Text("0".into())),
        ..AffectedValues::default()
    };
    policy
}

fn catalog() -> PolicyCatalog {
    [telemetry(), screen_saver()].into_iter().collect()
}

fn change(
    policy: &PolicyDefinition,
    scope: PolicyScope,
    desired_state: PolicyState,
    options: PolicyOptions,
) -> PolicyChangeRequest {
    PolicyChangeRequest {
        policy_id: policy.id.clone(),
        scope,
        desired_state,
        options,
    }
}

fn level(n: u32) -> PolicyOptions {
    PolicyOptions::from([("Level".to_string(), OptionValue::UInt(n))])
}

#[test]
fn changes_land_in_their_scope_and_survive_a_file_round_trip() {
    let catalog = catalog();
    let changes = vec![
        change(&telemetry(), PolicyScope::Machine, PolicyState::Enabled, level(2)),
        change(
            &screen_saver(),
            PolicyScope::User,
            PolicyState::Disabled,
            PolicyOptions::new(),
        ),
        change(&telemetry(), PolicyScope::User, PolicyState::Enabled, level(1)),
        PolicyChangeRequest {
            policy_id: PolicyId::new("Contoso.Missing", "Nothing"),
            scope: PolicyScope::Machine,
            desired_state: PolicyState::Enabled,
            options: PolicyOptions::new(),
        },
        change(&telemetry(), PolicyScope::Machine, PolicyState::Enabled, level(9)),
    ];

    let report = build_buffers(&catalog, None, None, &changes);

    let statuses: Vec<_> = report.outcomes.iter().map(|o| &o.status).collect();
    assert_eq!(statuses[0], &ChangeStatus::Applied);
    assert_eq!(statuses[1], &ChangeStatus::Applied);
    assert_eq!(statuses[2], &ChangeStatus::SectionMismatch);
    assert_eq!(statuses[3], &ChangeStatus::UnknownPolicy);
    assert!(matches!(statuses[4], ChangeStatus::Failed { .. }));
    assert_eq!(report.applied(), 2);

    let dir = tempfile::tempdir().unwrap();
    let machine_path = dir.path().join("machine.pol");
    let user_path = dir.path().join("user.pol");
    PolFile::from_bytes(&report.buffers.machine)
        .unwrap()
        .save(&machine_path)
        .unwrap();
    PolFile::from_bytes(&report.buffers.user)
        .unwrap()
        .save(&user_path)
        .unwrap();

    let machine = PolFile::load(&machine_path).unwrap();
    let user = PolFile::load(&user_path).unwrap();

    assert_eq!(evaluate(&machine, &telemetry()), PolicyState::Enabled);
    assert_eq!(read_options(&machine, &telemetry()), level(2));
    assert_eq!(evaluate(&user, &telemetry()), PolicyState::NotConfigured);

    assert_eq!(evaluate(&user, &screen_saver()), PolicyState::Disabled);
    assert_eq!(
        user.get_value(DESKTOP_KEY, "screensaveactive"),
        Some(RegistryData::String("0".into()))
    );
    assert_eq!(evaluate(&machine, &screen_saver()), PolicyState::NotConfigured);
}

#[test]
fn not_configured_removes_every_footprint() {
    let catalog = catalog();
    let configured = build_buffers(
        &catalog,
        None,
        None,
        &[
            change(&telemetry(), PolicyScope::Machine, PolicyState::Enabled, level(3)),
            change(
                &screen_saver(),
                PolicyScope::User,
                PolicyState::Enabled,
                PolicyOptions::new(),
            ),
        ],
    );
    assert!(!PolFile::from_bytes(&configured.buffers.machine).unwrap().is_empty());

    let cleared = build_buffers(
        &catalog,
        Some(configured.buffers.machine.as_slice()),
        Some(configured.buffers.user.as_slice()),
        &[
            change(
                &telemetry(),
                PolicyScope::Machine,
                PolicyState::NotConfigured,
                PolicyOptions::new(),
            ),
            change(
                &screen_saver(),
                PolicyScope::User,
                PolicyState::NotConfigured,
                PolicyOptions::new(),
            ),
        ],
    );

    assert_eq!(cleared.applied(), 2);
    assert!(PolFile::from_bytes(&cleared.buffers.machine).unwrap().is_empty());
    assert!(PolFile::from_bytes(&cleared.buffers.user).unwrap().is_empty());
}

#[test]
fn rejected_changes_leave_earlier_writes_in_place() {
    let catalog = catalog();
    let report = build_buffers(
        &catalog,
        None,
        None,
        &[
            change(&telemetry(), PolicyScope::Machine, PolicyState::Enabled, level(1)),
            change(&telemetry(), PolicyScope::Machine, PolicyState::Enabled, level(150)),
            change(
                &telemetry(),
                PolicyScope::Machine,
                PolicyState::Enabled,
                PolicyOptions::new(),
            ),
        ],
    );

    assert_eq!(report.applied(), 1);
    let machine = PolFile::from_bytes(&report.buffers.machine).unwrap();
    assert_eq!(
        machine.get_value(TELEMETRY_KEY, "AllowTelemetry"),
        Some(RegistryData::DWord(1))
    );
}

#[test]
fn a_corrupt_scope_does_not_block_the_other() {
    let catalog = catalog();
    let healthy = build_buffers(
        &catalog,
        None,
        None,
        &[change(
            &screen_saver(),
            PolicyScope::User,
            PolicyState::Enabled,
            PolicyOptions::new(),
        )],
    );
    let mut corrupt = healthy.buffers.machine.clone();
    corrupt.truncate(corrupt.len().min(6));

    let report = build_buffers(
        &catalog,
        Some(corrupt.as_slice()),
        Some(healthy.buffers.user.as_slice()),
        &[
            change(&telemetry(), PolicyScope::Machine, PolicyState::Enabled, level(2)),
            change(
                &screen_saver(),
                PolicyScope::User,
                PolicyState::Disabled,
                PolicyOptions::new(),
            ),
        ],
    );

    assert!(report.scope_failed(PolicyScope::Machine));
    assert!(!report.scope_failed(PolicyScope::User));
    assert!(matches!(report.outcomes[0].status, ChangeStatus::Failed { .. }));
    assert_eq!(report.outcomes[1].status, ChangeStatus::Applied);

    assert_eq!(report.buffers.machine, corrupt);
    let user = PolFile::from_bytes(&report.buffers.user).unwrap();
    assert_eq!(evaluate(&user, &screen_saver()), PolicyState::Disabled);
}
