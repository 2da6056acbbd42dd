//! Ready-made patchers: the record groups, schema and precedence policy of
//! each common merge job

use crate::error::{Error, Result};
use crate::schema::{AttrKind, AttrSpec, GroupSchema, Schema};
use crate::store::Policy;

/// Groups whose editor ids the `editor_ids` patcher exchanges
pub const EDITOR_ID_GROUPS: &[&str] = &[
    "ACTI", "ALCH", "AMMO", "APPA", "ARMO", "BOOK", "BSGN", "CLAS", "CLOT", "CONT", "CREA", "DOOR",
    "ENCH", "EYES", "FACT", "FLOR", "FURN", "HAIR", "INGR", "KEYM", "LIGH", "MISC", "NPC_", "QUST",
    "RACE", "SGST", "SLGM", "SPEL", "WEAP",
];

/// Groups carrying a display name
pub const NAMED_GROUPS: &[&str] = &[
    "ACTI", "ALCH", "AMMO", "APPA", "ARMO", "BOOK", "BSGN", "CLAS", "CLOT", "CONT", "CREA", "DOOR",
    "ENCH", "EYES", "FACT", "FLOR", "FURN", "HAIR", "INGR", "KEYM", "LIGH", "MGEF", "MISC", "NPC_",
    "QUST", "RACE", "SGST", "SLGM", "SPEL", "WEAP",
];

/// A named merge job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Patcher {
    pub name: &'static str,
    pub description: &'static str,
    pub groups: Vec<GroupSchema>,
    /// Groups read for labels only
    pub label_groups: Vec<String>,
    pub policy: Policy,
    /// Whether label changes should be carried into scripts
    pub renames_scripts: bool,
}

impl Patcher {
    /// Every preset, in a stable order
    pub fn all() -> Vec<Patcher> {
        vec![
            Self::factions(),
            Self::relations(),
            Self::editor_ids(),
            Self::full_names(),
            Self::item_stats(),
            Self::actor_levels(),
        ]
    }

    pub fn by_name(name: &str) -> Option<Patcher> {
        Self::all().into_iter().find(|p| p.name == name)
    }

    /// Like [`by_name`](Self::by_name) but failing with [`Error::UnknownPatcher`]
    pub fn require(name: &str) -> Result<Patcher> {
        Self::by_name(name).ok_or_else(|| Error::UnknownPatcher(name.to_string()))
    }

    /// Faction memberships of actors
    pub fn factions() -> Self {
        let groups = ["CREA", "NPC_"]
            .iter()
            .map(|tag| {
                let factions = AttrSpec::new("factions", "Rank", AttrKind::Links);
                GroupSchema::links(*tag, factions, "Actor", "Faction")
            })
            .collect();
        Self {
            name: "factions",
            description: "faction memberships and ranks of creatures and NPCs",
            groups,
            label_groups: vec!["FACT".to_string()],
            policy: Policy::LastWins,
            renames_scripts: false,
        }
    }

    /// Dispositions between factions
    pub fn relations() -> Self {
        Self {
            name: "relations",
            description: "dispositions between factions",
            groups: vec![GroupSchema::links(
                "FACT",
                AttrSpec::new("relations", "Disp", AttrKind::Links),
                "Main",
                "Other",
            )],
            label_groups: Vec::new(),
            policy: Policy::LastWins,
            renames_scripts: false,
        }
    }

    /// Editor ids, with renames carried into scripts
    pub fn editor_ids() -> Self {
        let groups = EDITOR_ID_GROUPS
            .iter()
            .map(|tag| {
                GroupSchema::columns(*tag)
                    .attr(AttrSpec::new("eid", "Editor Id", AttrKind::String))
                    .with_label("eid")
                    .with_strict_labels()
                    .with_rename_column("Old Editor Id")
            })
            .collect();
        Self {
            name: "editor_ids",
            description: "editor ids; renamed ids are replaced in scripts",
            groups,
            label_groups: Vec::new(),
            policy: Policy::LastWins,
            renames_scripts: true,
        }
    }

    /// Display names
    pub fn full_names() -> Self {
        let groups = NAMED_GROUPS
            .iter()
            .map(|tag| {
                GroupSchema::columns(*tag)
                    .attr(AttrSpec::new("eid", "Editor Id", AttrKind::String).optional())
                    .attr(AttrSpec::new("full", "Name", AttrKind::String))
                    .with_label("eid")
            })
            .collect();
        Self {
            name: "full_names",
            description: "display names",
            groups,
            label_groups: Vec::new(),
            policy: Policy::LastWins,
            renames_scripts: false,
        }
    }

    /// Weight, value and combat stats of items
    pub fn item_stats() -> Self {
        let stats = |tag: &str, extra: &[(&str, &str, AttrKind)]| {
            let mut group = GroupSchema::columns(tag)
                .attr(AttrSpec::new("eid", "Editor Id", AttrKind::String).optional())
                .attr(AttrSpec::new("weight", "Weight", AttrKind::Float))
                .attr(AttrSpec::new("value", "Value", AttrKind::Int));
            for (name, header, kind) in extra {
                group = group.attr(AttrSpec::new(*name, *header, *kind));
            }
            group.with_label("eid")
        };
        let enchant =
            AttrSpec::new("enchant_points", "Enchantment Points", AttrKind::Int).optional();
        let groups = vec![
            stats("ALCH", &[]),
            stats(
                "AMMO",
                &[("damage", "Damage", AttrKind::Int), ("speed", "Speed", AttrKind::Float)],
            )
                .attr(enchant.clone()),
            stats("APPA", &[("quality", "Quality", AttrKind::Float)]),
            stats(
                "ARMO",
                &[
                    ("health", "Health", AttrKind::Int),
                    ("strength", "Armor Rating", AttrKind::Int),
                ],
            ),
            stats("BOOK", &[]).attr(enchant.clone()),
            stats("CLOT", &[]).attr(enchant.clone()),
            stats("INGR", &[]),
            stats("KEYM", &[]),
            stats("LIGH", &[("duration", "Duration", AttrKind::Int)]),
            stats("MISC", &[]),
            stats("SGST", &[("uses", "Uses", AttrKind::Int)]),
            stats("SLGM", &[]),
            stats(
                "WEAP",
                &[
                    ("health", "Health", AttrKind::Int),
                    ("damage", "Damage", AttrKind::Int),
                    ("speed", "Speed", AttrKind::Float),
                    ("reach", "Reach", AttrKind::Float),
                ],
            )
            .attr(enchant),
        ];
        Self {
            name: "item_stats",
            description: "weight, value and combat stats of items",
            groups,
            label_groups: Vec::new(),
            policy: Policy::LastWins,
            renames_scripts: false,
        }
    }

    /// NPC level offsets, shown next to the base game's values
    pub fn actor_levels() -> Self {
        let level = |name: &str, header: &str| AttrSpec::new(name, header, AttrKind::Int);
        let npcs = GroupSchema::columns("NPC_")
            .attr(AttrSpec::new("eid", "Actor Eid", AttrKind::String).optional())
            .attr(level("pc_level_offset", "IsPCLevelOffset").optional())
            .attr(level("level", "Offset"))
            .attr(level("calc_min", "CalcMin"))
            .attr(level("calc_max", "CalcMax"))
            .with_label("eid")
            .with_comparison("Old");
        Self {
            name: "actor_levels",
            description: "NPC level offsets and calculated level range",
            groups: vec![npcs],
            label_groups: Vec::new(),
            policy: Policy::LastWins,
            renames_scripts: false,
        }
    }

    /// Whether exports carry comparison columns filled from a baseline
    pub fn has_comparison(&self) -> bool {
        self.groups.iter().any(|g| g.comparison_prefix.is_some())
    }

    /// Schema holding this patcher's groups
    pub fn schema(&self) -> Result<Schema> {
        let mut schema = Schema::new();
        for group in &self.groups {
            schema.register(group.clone())?;
        }
        Ok(schema)
    }

    /// Tags of the groups this patcher merges
    pub fn group_tags(&self) -> Vec<String> {
        self.groups.iter().map(|g| g.tag.clone()).collect()
    }
}
