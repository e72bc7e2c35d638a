//! Tickets keep chunks loaded at a level.

use smallvec::SmallVec;
use steel_utils::ChunkPos;

/// A kind of ticket.
///
/// Tickets of a type with a non-zero `timeout` expire that many ticks after
/// they were added.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TicketType {
    /// Name used in logs and debug output; also the type's identity.
    pub name: &'static str,
    /// Lifetime in ticks, `0` for tickets that never expire.
    pub timeout: u64,
}

impl TicketType {
    /// Keeps the spawn area loaded.
    pub const START: TicketType = TicketType::new("start", 0);
    /// Chunks around a player.
    pub const PLAYER: TicketType = TicketType::new("player", 0);
    /// Force-loaded chunks.
    pub const FORCED: TicketType = TicketType::new("forced", 0);
    /// Held while a `get_or_load_chunk` request is pending.
    pub const CHUNK_LOAD: TicketType = TicketType::new("chunk_load", 0);
    /// Placed by a chunk on a neighbour it needs for generation.
    pub const GENERATION_DEPENDENCY: TicketType = TicketType::new("generation_dependency", 0);
    /// Short-lived ticket after a portal was used.
    pub const PORTAL: TicketType = TicketType::new("portal", 300);
    /// Short-lived ticket after a teleport.
    pub const POST_TELEPORT: TicketType = TicketType::new("post_teleport", 5);
    /// Holds off the next unload attempt of a chunk that was in use when it was unloaded.
    pub const UNLOAD_COOLDOWN: TicketType = TicketType::new("unload_cooldown", 100);

    /// Creates a ticket type.
    #[must_use]
    pub const fn new(name: &'static str, timeout: u64) -> Self {
        Self { name, timeout }
    }

    /// Returns true if tickets of this type expire.
    #[must_use]
    pub const fn expires(self) -> bool {
        self.timeout != 0
    }
}

/// A ticket held at a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ticket {
    /// Kind of ticket.
    pub ticket_type: TicketType,
    /// Level the ticket holds its chunk at.
    pub level: u8,
    /// Caller-chosen identifier distinguishing tickets of the same type and level.
    pub id: u64,
}

impl Ticket {
    /// Creates a ticket.
    #[must_use]
    pub const fn new(ticket_type: TicketType, level: u8, id: u64) -> Self {
        Self {
            ticket_type,
            level,
            id,
        }
    }

    fn matches(&self, other: &Ticket) -> bool {
        self.ticket_type.name == other.ticket_type.name
            && self.level == other.level
            && self.id == other.id
    }
}

#[derive(Debug, Clone, Copy)]
struct TicketEntry {
    ticket: Ticket,
    remove_at: Option<u64>,
}

/// Multiset of tickets at one coordinate.
///
/// The same ticket may be present several times; each add needs its own remove.
#[derive(Debug, Clone, Default)]
pub(crate) struct ChunkTickets {
    entries: SmallVec<[TicketEntry; 4]>,
}

impl ChunkTickets {
    /// Lowest level among the tickets, the coordinate's own source level.
    pub(crate) fn min_level(&self) -> Option<u8> {
        self.entries.iter().map(|entry| entry.ticket.level).min()
    }

    pub(crate) fn add(&mut self, ticket: Ticket, current_tick: u64) {
        let remove_at = ticket
            .ticket_type
            .expires()
            .then(|| current_tick + ticket.ticket_type.timeout);
        self.entries.push(TicketEntry { ticket, remove_at });
    }

    /// Removes one instance of `ticket`.
    pub(crate) fn remove(&mut self, ticket: &Ticket) -> bool {
        match self.entries.iter().position(|entry| entry.ticket.matches(ticket)) {
            Some(index) => {
                self.entries.remove(index);
                true
            }
            None => false,
        }
    }

    /// Removes every instance matching the given type, level and id.
    pub(crate) fn remove_all(&mut self, ticket: &Ticket) -> usize {
        let before = self.entries.len();
        self.entries.retain(|entry| !entry.ticket.matches(ticket));
        before - self.entries.len()
    }

    /// Drops tickets whose timeout passed; returns how many were dropped.
    pub(crate) fn expire(&mut self, current_tick: u64) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|entry| entry.remove_at.is_none_or(|at| at > current_tick));
        before - self.entries.len()
    }

    pub(crate) fn has_timed(&self) -> bool {
        self.entries.iter().any(|entry| entry.remove_at.is_some())
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn tickets(&self) -> impl Iterator<Item = Ticket> + '_ {
        self.entries.iter().map(|entry| entry.ticket)
    }

    pub(crate) fn to_json(&self, pos: ChunkPos) -> serde_json::Value {
        let tickets: Vec<_> = self
            .entries
            .iter()
            .map(|entry| {
                serde_json::json!({
                    "type": entry.ticket.ticket_type.name,
                    "level": entry.ticket.level,
                    "id": entry.ticket.id,
                    "remove_at": entry.remove_at,
                })
            })
            .collect();
        serde_json::json!({
            "chunkX": pos.x,
            "chunkZ": pos.z,
            "tickets": tickets,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_multiset_needs_matching_removes() {
        let ticket = Ticket::new(TicketType::FORCED, 31, 1);
        let mut tickets = ChunkTickets::default();
        tickets.add(ticket, 0);
        tickets.add(ticket, 0);
        assert!(tickets.remove(&ticket));
        assert_eq!(tickets.min_level(), Some(31));
        assert!(tickets.remove(&ticket));
        assert!(!tickets.remove(&ticket));
        assert!(tickets.is_empty());
    }

    #[test]
    fn test_min_level() {
        let mut tickets = ChunkTickets::default();
        tickets.add(Ticket::new(TicketType::PLAYER, 33, 7), 0);
        tickets.add(Ticket::new(TicketType::FORCED, 31, 7), 0);
        assert_eq!(tickets.min_level(), Some(31));
    }

    #[test]
    fn test_expiry() {
        let mut tickets = ChunkTickets::default();
        tickets.add(Ticket::new(TicketType::POST_TELEPORT, 30, 0), 10);
        tickets.add(Ticket::new(TicketType::FORCED, 33, 0), 10);
        assert!(tickets.has_timed());
        assert_eq!(tickets.expire(14), 0);
        assert_eq!(tickets.expire(15), 1);
        assert!(!tickets.has_timed());
        assert_eq!(tickets.min_level(), Some(33));
    }

    #[test]
    fn test_portal_outlives_teleport() {
        let mut tickets = ChunkTickets::default();
        tickets.add(Ticket::new(TicketType::PORTAL, 33, 0), 0);
        tickets.add(Ticket::new(TicketType::POST_TELEPORT, 32, 0), 0);
        assert_eq!(tickets.expire(TicketType::POST_TELEPORT.timeout), 1);
        assert_eq!(tickets.min_level(), Some(33));
        assert_eq!(tickets.expire(TicketType::PORTAL.timeout), 1);
        assert!(tickets.is_empty());
    }
}
