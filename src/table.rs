//! 固定容量连接表
//!
//! 以 [`SlotId`] 寻址的槽位数组。分配时从空闲链表弹出，复杂度 O(1)，
//! 全部占满时明确失败。槽位只可能是 `Empty`、`Pending`（握手期间预留，尚无连接）
//! 或持有完整连接的 `Active`，无法存放半个连接。

use std::fmt;

/// 槽位索引
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId(usize);

impl SlotId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// 槽位的可观察状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Empty,
    Pending,
    Active,
}

enum Slot<T> {
    Empty,
    Pending,
    Active(T),
}

impl<T> Slot<T> {
    fn state(&self) -> SlotState {
        match self {
            Slot::Empty => SlotState::Empty,
            Slot::Pending => SlotState::Pending,
            Slot::Active(_) => SlotState::Active,
        }
    }
}

pub struct ConnectionTable<T> {
    slots: Vec<Slot<T>>,
    free: Vec<usize>,
    pending: usize,
    active: usize,
}

impl<T> ConnectionTable<T> {
    /// 创建含 `capacity` 个空槽位的表
    pub fn with_capacity(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || Slot::Empty);
        Self {
            slots,
            // 倒序存放，先分配最小的索引
            free: (0..capacity).rev().collect(),
            pending: 0,
            active: 0,
        }
    }

    /// 预留一个空槽位，表满时返回 `None`
    pub fn allocate(&mut self) -> Option<SlotId> {
        let index = self.free.pop()?;
        debug_assert!(matches!(self.slots[index], Slot::Empty));
        self.slots[index] = Slot::Pending;
        self.pending += 1;
        Some(SlotId(index))
    }

    /// 用已完整建立的连接填充预留槽位
    ///
    /// 槽位不是预留状态（已被释放或越界）时原样交还，由调用方处理。
    pub fn activate(&mut self, id: SlotId, value: T) -> Result<(), T> {
        let Some(slot) = self.slots.get_mut(id.0) else {
            return Err(value);
        };
        if !matches!(slot, Slot::Pending) {
            return Err(value);
        }
        *slot = Slot::Active(value);
        self.pending -= 1;
        self.active += 1;
        Ok(())
    }

    /// 将槽位归还空闲链表
    ///
    /// 幂等：释放空槽位不做任何事。活动槽位会交出其连接，由调用方关闭。
    pub fn release(&mut self, id: SlotId) -> Option<T> {
        let slot = self.slots.get_mut(id.0)?;
        match std::mem::replace(slot, Slot::Empty) {
            Slot::Empty => None,
            Slot::Pending => {
                self.pending -= 1;
                self.free.push(id.0);
                None
            }
            Slot::Active(value) => {
                self.active -= 1;
                self.free.push(id.0);
                Some(value)
            }
        }
    }

    pub fn state(&self, id: SlotId) -> Option<SlotState> {
        self.slots.get(id.0).map(Slot::state)
    }

    pub fn get(&self, id: SlotId) -> Option<&T> {
        match self.slots.get(id.0) {
            Some(Slot::Active(value)) => Some(value),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, id: SlotId) -> Option<&mut T> {
        match self.slots.get_mut(id.0) {
            Some(Slot::Active(value)) => Some(value),
            _ => None,
        }
    }

    /// 按索引顺序列出活动槽位
    pub fn iter_active(&self) -> impl Iterator<Item = (SlotId, &T)> {
        self.slots.iter().enumerate().filter_map(|(i, slot)| match slot {
            Slot::Active(value) => Some((SlotId(i), value)),
            _ => None,
        })
    }

    pub fn active_ids(&self) -> Vec<SlotId> {
        self.iter_active().map(|(id, _)| id).collect()
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn active_len(&self) -> usize {
        self.active
    }

    pub fn pending_len(&self) -> usize {
        self.pending
    }

    pub fn free_len(&self) -> usize {
        self.free.len()
    }

    pub fn is_full(&self) -> bool {
        self.free.is_empty()
    }
}

/// 事件循环一轮中等待的对象
///
/// 只由连接表推导，每轮重新计算。监听器始终包含在内：表满时仍接受连接，
/// 以便明确拒绝。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interest {
    pub listener: bool,
    pub client: Vec<SlotId>,
    pub host: Vec<SlotId>,
}

impl Interest {
    pub fn from_table<T>(table: &ConnectionTable<T>) -> Self {
        let active = table.active_ids();
        Self {
            listener: true,
            client: active.clone(),
            host: active,
        }
    }

    pub fn len(&self) -> usize {
        usize::from(self.listener) + self.client.len() + self.host.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
