//! Subscription wiring. Each declared state gets one subscription on the component;
//! fragment instances register their state-dependent sites with it while they live.
//! Loop variables are per item, so item instances subscribe to them directly.

use serde::Serialize;

use crate::analyze::Dependency;
use crate::codegen::{ComponentProgram, Emitter, FragmentProgram, UpdateOp};
use crate::plan::{BlockKind, FragmentId, FragmentKind, SlotId};
use crate::scope::RESERVED_CONTEXT;

/// Update callbacks to re-run when `dependency` changes.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    pub dependency: Dependency,
    /// In slot order
    pub updates: Vec<UpdateOp>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FragmentWiring {
    pub fragment: FragmentId,
    /// State-dependent sites, state in declaration order. A live instance registers
    /// them with the component and the state's single subscription runs them.
    pub state_updates: Vec<Subscription>,
    /// Loop variables outermost first, subscribed by each instance in `create()`
    pub local_subscriptions: Vec<Subscription>,
}

impl FragmentWiring {
    /// Whether instances of this fragment join the component's site registry.
    pub fn registers_sites(&self) -> bool {
        !self.state_updates.is_empty()
    }

    pub fn updates_for_state(&self, state: &str) -> &[UpdateOp] {
        self.state_updates
            .iter()
            .find(|s| matches!(&s.dependency, Dependency::State(name) if name == state))
            .map(|s| s.updates.as_slice())
            .unwrap_or_default()
    }
}

/// The one subscription of a declared state. On change it runs the registered
/// instances of `fragments`, fragment order first, then slot order.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSubscription {
    pub state: String,
    pub fragments: Vec<FragmentId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SiteRef {
    pub fragment: FragmentId,
    pub slot: SlotId,
}

/// What running a handler may invalidate. Informational; emitted code does not use it.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HandlerLink {
    pub handler: String,
    pub writes: Vec<String>,
    pub invalidates: Vec<SiteRef>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Wiring {
    /// One per declared state, in declaration order
    pub states: Vec<StateSubscription>,
    pub fragments: Vec<FragmentWiring>,
    pub handlers: Vec<HandlerLink>,
}

impl Wiring {
    pub fn fragment(&self, id: FragmentId) -> Option<&FragmentWiring> {
        self.fragments.iter().find(|f| f.fragment == id)
    }

    pub fn state(&self, name: &str) -> Option<&StateSubscription> {
        self.states.iter().find(|s| s.state == name)
    }

    /// Subscription registrations in the emitted module: one per state plus one per
    /// loop variable per fragment (made once per live instance).
    pub fn subscription_count(&self) -> usize {
        self.states.len()
            + self
                .fragments
                .iter()
                .map(|f| f.local_subscriptions.len())
                .sum::<usize>()
    }

    pub fn handler(&self, name: &str) -> Option<&HandlerLink> {
        self.handlers.iter().find(|h| h.handler == name)
    }
}

pub fn wire_component(program: &ComponentProgram) -> Wiring {
    let fragments: Vec<FragmentWiring> = program
        .fragments
        .iter()
        .map(|fragment| wire_fragment(program, fragment))
        .collect();

    let states = program
        .states
        .iter()
        .map(|state| StateSubscription {
            state: state.name.clone(),
            fragments: fragments
                .iter()
                .filter(|f| !f.updates_for_state(&state.name).is_empty())
                .map(|f| f.fragment)
                .collect(),
        })
        .collect();

    let handlers = program
        .handlers
        .iter()
        .map(|handler| {
            let mut invalidates = Vec::new();
            for name in &handler.writes {
                let dependency = Dependency::State(name.clone());
                for fragment in &program.fragments {
                    collect_invalidated(program, fragment, &dependency, &mut invalidates);
                }
            }
            HandlerLink {
                handler: handler.name.clone(),
                writes: handler.writes.clone(),
                invalidates,
            }
        })
        .collect();

    let wiring = Wiring {
        states,
        fragments,
        handlers,
    };
    log::debug!(
        "wired `{}`: {} state subscription(s), {} subscription(s) in total across {} fragment(s)",
        program.name,
        wiring.states.len(),
        wiring.subscription_count(),
        wiring.fragments.len()
    );
    wiring
}

fn updates_reading(fragment: &FragmentProgram, dependency: &Dependency) -> Vec<UpdateOp> {
    fragment
        .updates
        .iter()
        .filter(|u| u.deps.contains(dependency))
        .map(|u| u.op.clone())
        .collect()
}

fn wire_fragment(program: &ComponentProgram, fragment: &FragmentProgram) -> FragmentWiring {
    let state_updates = program
        .states
        .iter()
        .map(|s| Dependency::State(s.name.clone()))
        .filter_map(|dependency| {
            let updates = updates_reading(fragment, &dependency);
            (!updates.is_empty()).then_some(Subscription { dependency, updates })
        })
        .collect();

    let mut local_subscriptions: Vec<Subscription> = Vec::new();
    for dependency in fragment.locals.iter().map(|l| Dependency::Local(l.clone())) {
        // a loop variable may shadow an outer one of the same name
        if local_subscriptions.iter().any(|s| s.dependency == dependency) {
            continue;
        }
        let updates = updates_reading(fragment, &dependency);
        if !updates.is_empty() {
            local_subscriptions.push(Subscription { dependency, updates });
        }
    }

    FragmentWiring {
        fragment: fragment.id,
        state_updates,
        local_subscriptions,
    }
}

/// Sites in `fragment` that re-run when `dependency` changes, followed through loop
/// blocks into the item fragments whose local signals they update.
fn collect_invalidated(
    program: &ComponentProgram,
    fragment: &FragmentProgram,
    dependency: &Dependency,
    out: &mut Vec<SiteRef>,
) {
    for update in fragment.updates.iter().filter(|u| u.deps.contains(dependency)) {
        let site = SiteRef {
            fragment: fragment.id,
            slot: update.op.slot(),
        };
        if out.contains(&site) {
            continue;
        }
        out.push(site);

        let UpdateOp::UpdateBlock { block, .. } = &update.op else {
            continue;
        };
        let Some(BlockKind::Loop { item_var, index_var, body, .. }) = program.block(*block).map(|b| &b.kind) else {
            continue;
        };
        for var in std::iter::once(item_var).chain(index_var.iter()) {
            let local = Dependency::Local(var.clone());
            for inner in descendants(program, *body, var) {
                collect_invalidated(program, inner, &local, out);
            }
        }
    }
}

/// `root` and every fragment nested below it in which `var` still names the same local.
fn descendants<'p>(program: &'p ComponentProgram, root: FragmentId, var: &str) -> Vec<&'p FragmentProgram> {
    let mut found: Vec<&FragmentProgram> = program.fragment(root).into_iter().collect();
    let mut index = 0;
    while index < found.len() {
        let parent = found[index].id;
        for fragment in &program.fragments {
            let child_parent = match &fragment.kind {
                FragmentKind::ConditionalBranch { parent, .. } => Some(*parent),
                FragmentKind::LoopItem {
                    parent,
                    item_var,
                    index_var,
                    ..
                } if item_var != var && index_var.as_deref() != Some(var) => Some(*parent),
                _ => None,
            };
            if child_parent == Some(parent) {
                found.push(fragment);
            }
        }
        index += 1;
    }
    found
}

/// Registry of live instances of `fragment` inside the component context.
fn site_registry(fragment: FragmentId) -> String {
    format!("{}.sites[{}]", RESERVED_CONTEXT, fragment.0)
}

/// Per-instance object holding one method per state this fragment renders.
pub(crate) fn emit_site_object(e: &mut Emitter, wiring: &FragmentWiring) {
    if !wiring.registers_sites() {
        return;
    }
    e.open("const site = {");
    for subscription in &wiring.state_updates {
        e.open(format!("{}() {{", subscription.dependency.name()));
        for update in &subscription.updates {
            e.line(update.to_js());
        }
        e.close("},");
    }
    e.close("};");
}

/// Emitted last in `create()`, once every slot exists.
pub(crate) fn emit_instance_registration(e: &mut Emitter, wiring: &FragmentWiring) {
    if wiring.registers_sites() {
        e.line(format!("{}.add(site);", site_registry(wiring.fragment)));
    }
    for subscription in &wiring.local_subscriptions {
        e.open(format!(
            "subscriptions.push({}.locals.{}.subscribe(() => {{",
            RESERVED_CONTEXT,
            subscription.dependency.name()
        ));
        for update in &subscription.updates {
            e.line(update.to_js());
        }
        e.close("}));");
    }
}

pub(crate) fn emit_instance_release(e: &mut Emitter, wiring: &FragmentWiring) {
    if wiring.registers_sites() {
        e.line(format!("{}.delete(site);", site_registry(wiring.fragment)));
    }
}

/// The component-level subscriptions, one per state, registered in the constructor.
pub(crate) fn emit_state_subscriptions(e: &mut Emitter, wiring: &Wiring) {
    for subscription in &wiring.states {
        e.open(format!(
            "subscriptions.push({}.state.{}.subscribe(() => {{",
            RESERVED_CONTEXT, subscription.state
        ));
        for fragment in &subscription.fragments {
            e.line(format!(
                "for (const site of {}) site.{}();",
                site_registry(*fragment),
                subscription.state
            ));
        }
        e.close("}));");
    }
}
