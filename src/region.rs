//! Region tree produced by structural analysis.
//!
//! [`RegionNode`] is the serializable interface: a node with a kind, role-tagged
//! children and the loop head's exit-polarity flags. It is validated into the
//! closed [`Region`] type before code generation.

use crate::cfg::{BlockId, Function};
use serde::{Deserialize, Serialize};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("region {region:?}: missing child with role {role}")]
    MissingRole { region: String, role: Role },
    #[error("region {region:?}: more than one child with role {role}")]
    DuplicateRole { region: String, role: Role },
    #[error("region {region:?}: unexpected child {child:?}")]
    UnexpectedChild { region: String, child: String },
    #[error("region {region:?}: loop head must have exactly one exit polarity flag")]
    ExitPolarity { region: String },
    #[error("region {region:?}: child with role {role} must be a single basic block")]
    NotALeaf { region: String, role: Role },
    #[error("region {region:?}: unknown basic block")]
    UnknownBlock { region: String },
    #[error("region {region:?}: basic block region has children")]
    LeafWithChildren { region: String },
    #[error("region {region:?}: empty block region")]
    EmptyBlock { region: String },
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Kind {
    Block,
    IfThen,
    IfThenElse,
    WhileLoop,
}

/// Role of a child inside its parent region.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Role {
    If,
    Then,
    Else,
    Pre,
    Head,
    Tail,
    Exit,
}

/// Region node as handed over by structural analysis.
///
/// A node without a kind is a basic block and its name is the block label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionNode {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<Kind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub exit_if_true: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub exit_if_false: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<RegionNode>,
}

impl RegionNode {
    #[must_use]
    pub fn leaf(label: impl Into<String>) -> Self {
        Self {
            name: label.into(),
            kind: None,
            role: None,
            exit_if_true: false,
            exit_if_false: false,
            children: Vec::new(),
        }
    }

    #[must_use]
    pub fn composite(name: impl Into<String>, kind: Kind, children: Vec<RegionNode>) -> Self {
        Self {
            kind: Some(kind),
            children,
            ..Self::leaf(name)
        }
    }

    #[must_use]
    pub fn with_role(mut self, role: Role) -> Self {
        self.role = Some(role);
        self
    }

    #[must_use]
    pub fn exit_if(mut self, value: bool) -> Self {
        self.exit_if_true = value;
        self.exit_if_false = !value;
        self
    }

    fn child(&self, role: Role) -> Result<&RegionNode, Error> {
        let mut matching = self.children.iter().filter(|c| c.role == Some(role));
        let child = matching.next().ok_or_else(|| Error::MissingRole {
            region: self.name.clone(),
            role,
        })?;
        if matching.next().is_some() {
            return Err(Error::DuplicateRole {
                region: self.name.clone(),
                role,
            });
        }
        Ok(child)
    }

    fn expect_roles(&self, roles: &[Role]) -> Result<(), Error> {
        match self
            .children
            .iter()
            .find(|c| !c.role.is_some_and(|role| roles.contains(&role)))
        {
            Some(child) => Err(Error::UnexpectedChild {
                region: self.name.clone(),
                child: child.name.clone(),
            }),
            None => Ok(()),
        }
    }
}

/// Which outcome of the loop condition leaves the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExitPolarity {
    IfTrue,
    IfFalse,
}

/// Validated region tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Region {
    Leaf(BlockId),
    Block {
        name: String,
        children: Vec<Region>,
    },
    IfThen {
        name: String,
        cond: Box<Region>,
        then: Box<Region>,
    },
    IfThenElse {
        name: String,
        cond: Box<Region>,
        then: Box<Region>,
        otherwise: Box<Region>,
    },
    WhileLoop {
        name: String,
        pre: BlockId,
        head: Box<Region>,
        tail: Box<Region>,
        exit: BlockId,
        exit_on: ExitPolarity,
    },
}

impl Region {
    #[must_use]
    pub fn kind(&self) -> Option<Kind> {
        match self {
            Self::Leaf(_) => None,
            Self::Block { .. } => Some(Kind::Block),
            Self::IfThen { .. } => Some(Kind::IfThen),
            Self::IfThenElse { .. } => Some(Kind::IfThenElse),
            Self::WhileLoop { .. } => Some(Kind::WhileLoop),
        }
    }

    #[must_use]
    pub fn name<'a>(&'a self, function: &'a Function) -> &'a str {
        match self {
            Self::Leaf(block) => function.label(*block),
            Self::Block { name, .. }
            | Self::IfThen { name, .. }
            | Self::IfThenElse { name, .. }
            | Self::WhileLoop { name, .. } => name,
        }
    }

    /// First basic block executed when entering the region.
    #[must_use]
    pub fn first_leaf(&self) -> Option<BlockId> {
        match self {
            Self::Leaf(block) => Some(*block),
            Self::Block { children, .. } => children.first().and_then(Region::first_leaf),
            Self::IfThen { cond, .. } | Self::IfThenElse { cond, .. } => cond.first_leaf(),
            Self::WhileLoop { pre, .. } => Some(*pre),
        }
    }

    /// Last basic block in layout order.
    #[must_use]
    pub fn last_leaf(&self) -> Option<BlockId> {
        match self {
            Self::Leaf(block) => Some(*block),
            Self::Block { children, .. } => children.last().and_then(Region::last_leaf),
            Self::IfThen { then, .. } => then.last_leaf(),
            Self::IfThenElse { otherwise, .. } => otherwise.last_leaf(),
            Self::WhileLoop { exit, .. } => Some(*exit),
        }
    }

    /// All basic blocks in layout order.
    #[must_use]
    pub fn leaves(&self) -> Vec<BlockId> {
        let mut leaves = Vec::new();
        self.collect_leaves(&mut leaves);
        leaves
    }

    fn collect_leaves(&self, leaves: &mut Vec<BlockId>) {
        match self {
            Self::Leaf(block) => leaves.push(*block),
            Self::Block { children, .. } => {
                for child in children {
                    child.collect_leaves(leaves);
                }
            }
            Self::IfThen { cond, then, .. } => {
                cond.collect_leaves(leaves);
                then.collect_leaves(leaves);
            }
            Self::IfThenElse {
                cond,
                then,
                otherwise,
                ..
            } => {
                cond.collect_leaves(leaves);
                then.collect_leaves(leaves);
                otherwise.collect_leaves(leaves);
            }
            Self::WhileLoop {
                pre,
                head,
                tail,
                exit,
                ..
            } => {
                leaves.push(*pre);
                head.collect_leaves(leaves);
                tail.collect_leaves(leaves);
                leaves.push(*exit);
            }
        }
    }

    /// Convert back into the serializable form.
    #[must_use]
    pub fn to_node(&self, function: &Function) -> RegionNode {
        let name = self.name(function).to_string();
        match self {
            Self::Leaf(_) => RegionNode::leaf(name),
            Self::Block { children, .. } => RegionNode::composite(
                name,
                Kind::Block,
                children.iter().map(|c| c.to_node(function)).collect(),
            ),
            Self::IfThen { cond, then, .. } => RegionNode::composite(
                name,
                Kind::IfThen,
                vec![
                    cond.to_node(function).with_role(Role::If),
                    then.to_node(function).with_role(Role::Then),
                ],
            ),
            Self::IfThenElse {
                cond,
                then,
                otherwise,
                ..
            } => RegionNode::composite(
                name,
                Kind::IfThenElse,
                vec![
                    cond.to_node(function).with_role(Role::If),
                    then.to_node(function).with_role(Role::Then),
                    otherwise.to_node(function).with_role(Role::Else),
                ],
            ),
            Self::WhileLoop {
                pre,
                head,
                tail,
                exit,
                exit_on,
                ..
            } => RegionNode::composite(
                name,
                Kind::WhileLoop,
                vec![
                    RegionNode::leaf(function.label(*pre)).with_role(Role::Pre),
                    head.to_node(function)
                        .with_role(Role::Head)
                        .exit_if(*exit_on == ExitPolarity::IfTrue),
                    tail.to_node(function).with_role(Role::Tail),
                    RegionNode::leaf(function.label(*exit)).with_role(Role::Exit),
                ],
            ),
        }
    }
}

/// Validate a region node against the basic blocks of `function`.
pub fn resolve(node: &RegionNode, function: &Function) -> Result<Region, Error> {
    let region = node.name.clone();
    let Some(kind) = node.kind else {
        if !node.children.is_empty() {
            return Err(Error::LeafWithChildren { region });
        }
        return function
            .block_id(&node.name)
            .map(Region::Leaf)
            .ok_or(Error::UnknownBlock { region });
    };
    let child = |role| -> Result<Box<Region>, Error> {
        Ok(Box::new(resolve(node.child(role)?, function)?))
    };
    match kind {
        Kind::Block => {
            if node.children.is_empty() {
                return Err(Error::EmptyBlock { region });
            }
            let children = node
                .children
                .iter()
                .map(|c| resolve(c, function))
                .collect::<Result<_, _>>()?;
            Ok(Region::Block {
                name: region,
                children,
            })
        }
        Kind::IfThen => {
            node.expect_roles(&[Role::If, Role::Then])?;
            Ok(Region::IfThen {
                cond: child(Role::If)?,
                then: child(Role::Then)?,
                name: region,
            })
        }
        Kind::IfThenElse => {
            node.expect_roles(&[Role::If, Role::Then, Role::Else])?;
            Ok(Region::IfThenElse {
                cond: child(Role::If)?,
                then: child(Role::Then)?,
                otherwise: child(Role::Else)?,
                name: region,
            })
        }
        Kind::WhileLoop => {
            node.expect_roles(&[Role::Pre, Role::Head, Role::Tail, Role::Exit])?;
            let head_node = node.child(Role::Head)?;
            let exit_on = match (head_node.exit_if_true, head_node.exit_if_false) {
                (true, false) => ExitPolarity::IfTrue,
                (false, true) => ExitPolarity::IfFalse,
                _ => return Err(Error::ExitPolarity { region }),
            };
            let leaf = |role| match *child(role)? {
                Region::Leaf(block) => Ok(block),
                _ => Err(Error::NotALeaf {
                    region: region.clone(),
                    role,
                }),
            };
            Ok(Region::WhileLoop {
                pre: leaf(Role::Pre)?,
                head: child(Role::Head)?,
                tail: child(Role::Tail)?,
                exit: leaf(Role::Exit)?,
                exit_on,
                name: region.clone(),
            })
        }
    }
}
