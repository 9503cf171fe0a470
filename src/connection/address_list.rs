use std::marker::PhantomData;

use crate::connection::config::AddressListBehavior;
use crate::protocol::transport::BrokerAddress;
use crate::util::random::{Random, RngRandom};


/// The broker addresses a connection may use, in the order they are tried
pub struct AddressList<R: Random = RngRandom> {
    addresses: Vec<BrokerAddress>,
    behavior: AddressListBehavior,
    _random: PhantomData<R>,
}

impl<R: Random> AddressList<R> {
    pub fn new(addresses: Vec<BrokerAddress>, behavior: AddressListBehavior) -> AddressList<R> {
        AddressList {
            addresses,
            behavior,
            _random: Default::default(),
        }
    }

    pub fn addresses(&self) -> &[BrokerAddress] {
        &self.addresses
    }

    /// Candidates for one round of connection attempts: in configured order for `Priority`, in a
    ///  fresh random order per round for `Random`
    pub fn candidates(&self) -> Vec<BrokerAddress> {
        match self.behavior {
            AddressListBehavior::Priority => self.addresses.clone(),
            AddressListBehavior::Random => R::permutation(self.addresses.len())
                .into_iter()
                .filter_map(|i| self.addresses.get(i).cloned())
                .collect(),
        }
    }

    /// Moves `address` to the front, e.g. the broker a connection was redirected to. Returns
    ///  `true` if the list changed.
    pub fn prepend(&mut self, address: BrokerAddress) -> bool {
        if self.addresses.first() == Some(&address) {
            return false;
        }
        self.addresses.retain(|a| a != &address);
        self.addresses.insert(0, address);
        true
    }
}
